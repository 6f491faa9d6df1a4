use super::*;
use crate::flow::MatchInfo;
use crate::matches::{self, ACE_DEFAULT_PRIORITY};
use aclservice_types::{Acl, AclInterfaceBuilder, IpProtocol, PortRange};
use pretty_assertions::assert_eq;

const MAC: &str = "fa:16:3e:00:00:01";

fn aap(ip: &str, mac: &str) -> AllowedAddressPair {
    AllowedAddressPair::new(ip.parse().unwrap(), mac.parse().unwrap())
}

fn port(id: &str, sgs: &[&str], aaps: Vec<AllowedAddressPair>) -> AclInterface {
    AclInterface::builder(id)
        .dp_id(Some(1))
        .lport_tag(Some(42))
        .elan_id(Some(5000))
        .port_security_enabled(true)
        .security_groups(Some(sgs.iter().map(|s| s.to_string()).collect()))
        .allowed_address_pairs(aaps)
        .build()
}

fn compiler(direction: Direction) -> (Arc<AclDataIndex>, AclCompiler) {
    let index = Arc::new(AclDataIndex::new());
    let compiler = AclCompiler::new(direction, Arc::clone(&index), TimeoutsConfig::default());
    (index, compiler)
}

fn add_acl(index: &AclDataIndex, acl: Acl, tag: u32) {
    index.set_tag(&acl.name, tag);
    index.index_remote_acl(&acl);
    index.put_acl(acl);
}

fn sorted(delta: &FlowDelta) -> Vec<FlowEntry> {
    let mut flows: Vec<FlowEntry> = delta.flows().cloned().collect();
    flows.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
    flows
}

fn ssh_acl(name: &str) -> Acl {
    Acl::new(name).with_rule(
        Ace::new("ssh", Direction::Egress)
            .with_protocol(IpProtocol::Tcp)
            .with_dst_ports(PortRange::single(22)),
    )
}

#[test]
fn test_apply_requires_binding() {
    let (_, compiler) = compiler(Direction::Egress);
    let unbound = AclInterface::builder("p1")
        .port_security_enabled(true)
        .security_groups(Some(vec![]))
        .build();
    let err = compiler.apply_acl(&unbound).unwrap_err();
    assert!(matches!(err, AclServiceError::MissingSwitchId { .. }));
    assert!(err.is_precondition());

    let no_lport = AclInterfaceBuilder::from_existing(&unbound).dp_id(Some(1)).build();
    assert!(matches!(
        compiler.apply_acl(&no_lport).unwrap_err(),
        AclServiceError::MissingLportTag { .. }
    ));
}

#[test]
fn test_apply_requires_security_groups() {
    let (_, compiler) = compiler(Direction::Egress);
    let port = AclInterface::builder("p1")
        .dp_id(Some(1))
        .lport_tag(Some(42))
        .port_security_enabled(true)
        .build();
    assert!(matches!(
        compiler.apply_acl(&port).unwrap_err(),
        AclServiceError::MissingSecurityGroups { .. }
    ));
}

#[test]
fn test_apply_is_idempotent() {
    let (index, compiler) = compiler(Direction::Egress);
    add_acl(&index, ssh_acl("sg1"), 3);
    let p = port("p1", &["sg1"], vec![aap("10.0.0.5/32", MAC)]);
    index.index_interface(&p);

    let first = compiler.apply_acl(&p).unwrap();
    let second = compiler.apply_acl(&p).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.batches.len(), 1);
    assert_eq!(first.batches[0].key, "p1");
}

#[test]
fn test_remove_is_inverse_of_apply() {
    for direction in Direction::ALL {
        let (index, compiler) = compiler(direction);
        add_acl(&index, ssh_acl("sg1"), 3);
        add_acl(
            &index,
            Acl::new("sg2").with_rule(Ace::new("peers", direction).with_remote_group("sg2")),
            4,
        );
        let p = port(
            "p1",
            &["sg1", "sg2"],
            vec![aap("10.0.0.5/32", MAC), aap("fd00::5/128", MAC)],
        );
        index.index_interface(&p);

        let applied = compiler.apply_acl(&p).unwrap();
        let removed = compiler.remove_acl(&p).unwrap();
        assert!(removed.flows().all(|f| f.op == FlowOp::Remove));

        let expected: Vec<FlowEntry> = sorted(&applied).iter().map(FlowEntry::inverted).collect();
        assert_eq!(sorted(&removed), expected);
    }
}

#[test]
fn test_priority_includes_acl_tag() {
    let (index, compiler) = compiler(Direction::Egress);
    add_acl(&index, ssh_acl("sg5"), 5);
    add_acl(&index, ssh_acl("sg9"), 9);
    let p = port("p1", &["sg5", "sg9"], vec![]);

    let delta = compiler.apply_acl(&p).unwrap();
    let priority = |acl: &str| {
        delta
            .flows()
            .find(|f| f.flow_id.starts_with(&format!("egress_Filter_1_42_{}_ssh", acl)))
            .map(|f| f.priority)
            .unwrap()
    };
    assert_eq!(priority("sg9") - priority("sg5"), 4);
    assert!(priority("sg5") > ACE_DEFAULT_PRIORITY);
}

#[test]
fn test_chain_terminal() {
    let (index, compiler) = compiler(Direction::Ingress);
    let rule = |name: &str, remote: &str| Ace::new(name, Direction::Ingress).with_remote_group(remote);
    add_acl(
        &index,
        Acl::new("sg1")
            .with_rule(rule("a", "r12"))
            .with_rule(rule("b", "r3"))
            .with_rule(rule("c", "r7")),
        1,
    );
    for (name, tag) in [("r3", 3), ("r7", 7), ("r12", 12)] {
        add_acl(&index, Acl::new(name), tag);
    }
    let p = port("p1", &["sg1"], vec![]);
    assert_eq!(
        compiler.remote_acl_tags(&p, None).into_iter().collect::<Vec<_>>(),
        vec![3, 7, 12]
    );

    let ctx = compiler.port_context(&p).unwrap();
    let chain = compiler.dispatcher_flows(&ctx, &p, None, FlowOp::Add);
    let ids: Vec<&str> = chain.iter().map(|f| f.flow_id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "ingress_Dispatcher_First_1_42_3",
            "ingress_Dispatcher_Next_1_42_7",
            "ingress_Dispatcher_Next_1_42_12",
            "ingress_Dispatcher_Last_1_42_12",
        ]
    );

    let drops: Vec<&FlowEntry> = chain.iter().filter(|f| f.is_drop()).collect();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].matches, combined_metadata(42, 12));
    assert_eq!(chain[0].matches, compiler.profile().lport_matches(42));
    assert_eq!(chain[1].matches, combined_metadata(42, 3));
}

fn combined_metadata(lport: u32, tag: u32) -> Vec<MatchInfo> {
    vec![MatchInfo::Metadata {
        value: matches::lport_metadata_value(lport) | matches::remote_acl_tag_metadata_value(tag),
        mask: matches::LPORT_METADATA_MASK | matches::REMOTE_ACL_TAG_MASK,
    }]
}

#[test]
fn test_remote_rule_goes_to_rule_based_filter() {
    let (index, compiler) = compiler(Direction::Ingress);
    add_acl(
        &index,
        Acl::new("sg1").with_rule(
            Ace::new("web", Direction::Ingress)
                .with_protocol(IpProtocol::Tcp)
                .with_src_prefix("10.1.0.0/16".parse().unwrap())
                .with_dst_ports(PortRange::single(443))
                .with_remote_group("sg2"),
        ),
        1,
    );
    add_acl(&index, Acl::new("sg2"), 7);
    let p = port("p1", &["sg1"], vec![]);
    let ctx = compiler.port_context(&p).unwrap();
    let acl = index.get_acl("sg1").unwrap();

    let flows = compiler.ace_flows(&ctx, "sg1", &acl.rules[0], AceOp::Install);
    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(flow.table_id, 246);
    assert_eq!(flow.goto_table(), Some(247));
    assert_eq!(flow.priority, ACE_DEFAULT_PRIORITY + 1);
    assert_eq!(flow.matches[0], combined_metadata(42, 7)[0]);
    // The remote side (source, for ingress) is left to the remote ACL table.
    assert!(!flow.matches.iter().any(|m| matches!(m, MatchInfo::IpSrc(_))));
    assert!(flow.has_match(&MatchInfo::TcpDst {
        port: 443,
        mask: 0xffff
    }));
}

#[test]
fn test_remote_rule_without_remote_tag_is_deferred() {
    let (index, compiler) = compiler(Direction::Ingress);
    add_acl(
        &index,
        Acl::new("sg1").with_rule(Ace::new("peers", Direction::Ingress).with_remote_group("sg2")),
        1,
    );
    let p = port("p1", &["sg1"], vec![]);
    let ctx = compiler.port_context(&p).unwrap();
    let acl = index.get_acl("sg1").unwrap();
    assert!(compiler
        .ace_flows(&ctx, "sg1", &acl.rules[0], AceOp::Install)
        .is_empty());
}

#[test]
fn test_port_range_fans_out() {
    let (index, compiler) = compiler(Direction::Egress);
    add_acl(
        &index,
        Acl::new("sg1").with_rule(
            Ace::new("range", Direction::Egress)
                .with_protocol(IpProtocol::Udp)
                .with_dst_ports(PortRange::new(1000, 1005).unwrap()),
        ),
        1,
    );
    let p = port("p1", &["sg1"], vec![]);
    let ctx = compiler.port_context(&p).unwrap();
    let acl = index.get_acl("sg1").unwrap();

    let flows = compiler.ace_flows(&ctx, "sg1", &acl.rules[0], AceOp::Install);
    let dst: Vec<MatchInfo> = flows
        .iter()
        .flat_map(|f| f.matches.iter().filter(|m| matches!(m, MatchInfo::UdpDst { .. })).cloned())
        .collect();
    assert_eq!(
        dst,
        vec![
            MatchInfo::UdpDst {
                port: 1000,
                mask: 0xfffc
            },
            MatchInfo::UdpDst {
                port: 1004,
                mask: 0xfffe
            },
        ]
    );
    assert_eq!(flows[0].flow_id, "egress_Filter_1_42_sg1_range_dst1000/0xfffc");
}

#[test]
fn test_ace_of_other_direction_or_deleted_is_skipped() {
    let (index, compiler) = compiler(Direction::Egress);
    add_acl(&index, Acl::new("sg1"), 1);
    let p = port("p1", &["sg1"], vec![]);
    let ctx = compiler.port_context(&p).unwrap();

    let ingress = Ace::new("in", Direction::Ingress);
    assert!(compiler.ace_flows(&ctx, "sg1", &ingress, AceOp::Install).is_empty());

    let deleted = Ace::new("gone", Direction::Egress).mark_deleted();
    assert!(compiler.ace_flows(&ctx, "sg1", &deleted, AceOp::Add).is_empty());
    assert_eq!(compiler.ace_flows(&ctx, "sg1", &deleted, AceOp::Remove).len(), 1);
}

#[test]
fn test_remove_ace_retires_sessions() {
    let (index, compiler) = compiler(Direction::Egress);
    let acl = ssh_acl("sg1");
    add_acl(&index, acl.clone(), 2);
    let p = port("p1", &["sg1"], vec![]);

    let delta = compiler.remove_ace(&p, "sg1", &acl.rules[0]).unwrap();
    let removed: Vec<_> = delta.removed().collect();
    let added: Vec<_> = delta.added().collect();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].table_id, 215);
    assert_eq!(added.len(), 1);

    let retire = added[0];
    assert_eq!(retire.table_id, 214);
    assert_eq!(retire.hard_timeout, 18000);
    assert!(retire.has_match(&matches::ct_mark(matches::CT_MARK_ALLOWED)));
    assert_eq!(
        retire.instructions,
        matches::ct_commit_goto(5000, matches::CT_MARK_RETIRED, 215)
    );

    // Re-adding the rule drops the retire flow again.
    let delta = compiler.apply_ace(&p, "sg1", &acl.rules[0]).unwrap();
    assert_eq!(delta.removed().next().unwrap().flow_id, retire.flow_id);
}

#[test]
fn test_missing_elan_programs_nothing() {
    let (index, compiler) = compiler(Direction::Egress);
    add_acl(&index, Acl::new("sg1"), 1);
    let p = AclInterfaceBuilder::from_existing(&port(
        "p1",
        &["sg1"],
        vec![aap("10.0.0.5/32", MAC)],
    ))
    .elan_id(None)
    .build();

    // Untracked IP traffic would otherwise take the classifier's default
    // path straight to the exit table.
    let err = compiler.apply_acl(&p).unwrap_err();
    assert!(matches!(err, AclServiceError::MissingElanId { .. }));
    assert!(err.is_precondition());
    assert!(compiler.check_bound(&p).is_err());
}

#[test]
fn test_lport_tag_beyond_identity_field_is_rejected() {
    let (index, compiler) = compiler(Direction::Egress);
    add_acl(&index, ssh_acl("sg1"), 1);
    let p = AclInterfaceBuilder::from_existing(&port("p1", &["sg1"], vec![]))
        .lport_tag(Some(matches::LPORT_TAG_MAX + 1))
        .build();

    let err = compiler.apply_acl(&p).unwrap_err();
    assert!(matches!(err, AclServiceError::LportTagOutOfRange { .. }));
    assert!(err.is_precondition());

    let edge = AclInterfaceBuilder::from_existing(&p)
        .lport_tag(Some(matches::LPORT_TAG_MAX))
        .build();
    assert!(compiler.apply_acl(&edge).is_ok());
}

#[test]
fn test_remote_tag_beyond_metadata_field_is_deferred() {
    let (index, compiler) = compiler(Direction::Ingress);
    add_acl(
        &index,
        Acl::new("sg1").with_rule(Ace::new("peers", Direction::Ingress).with_remote_group("sg2")),
        1,
    );
    add_acl(&index, Acl::new("sg2"), matches::REMOTE_ACL_TAG_MAX + 1);
    let p = port("p1", &["sg1"], vec![]);

    assert_eq!(compiler.remote_tag("sg2"), None);
    assert!(compiler.remote_acl_tags(&p, None).is_empty());
    let delta = compiler.apply_acl(&p).unwrap();
    assert!(!delta.flows().any(|f| f.flow_id.contains("_Rbf_")));
    assert!(!delta.flows().any(|f| f.flow_id.contains("_Dispatcher_")));

    index.set_tag("sg2", matches::REMOTE_ACL_TAG_MAX);
    assert_eq!(compiler.remote_tag("sg2"), Some(matches::REMOTE_ACL_TAG_MAX));
}

#[test]
fn test_update_single_aap_is_minimal() {
    let (index, compiler) = compiler(Direction::Egress);
    add_acl(&index, ssh_acl("sg1"), 1);
    let existing = aap("10.0.0.5/32", MAC);
    let new_aap = aap("10.0.0.6/32", "fa:16:3e:00:00:02");
    let before = port("p1", &["sg1"], vec![existing.clone()]);
    let after = port("p1", &["sg1"], vec![existing, new_aap.clone()]);
    index.index_interface(&after);

    let delta = compiler.update_acl(&before, &after).unwrap();
    assert_eq!(delta.removed().count(), 0);
    assert!(!delta.is_empty());
    for flow in delta.flows() {
        assert!(
            flow.flow_id.contains("10.0.0.6") || flow.flow_id.contains("fa:16:3e:00:00:02"),
            "unexpected flow {}",
            flow.flow_id
        );
    }
}

#[test]
fn test_update_removing_one_of_two_v4_aaps_keeps_ether_flows() {
    let (index, compiler) = compiler(Direction::Egress);
    add_acl(&index, Acl::new("sg1"), 1);
    let a = aap("10.0.0.5/32", MAC);
    let b = aap("10.0.0.6/32", MAC);
    let before = port("p1", &["sg1"], vec![a.clone(), b]);
    let after = port("p1", &["sg1"], vec![a]);

    let delta = compiler.update_acl(&before, &after).unwrap();
    assert_eq!(delta.added().count(), 0);
    assert!(delta.removed().all(|f| f.flow_id.contains("10.0.0.6")));
}

#[test]
fn test_update_security_groups_deletes_before_adds() {
    let (index, compiler) = compiler(Direction::Egress);
    add_acl(&index, ssh_acl("sg1"), 1);
    add_acl(&index, ssh_acl("sg2"), 2);
    let before = port("p1", &["sg1"], vec![]);
    let after = port("p1", &["sg2"], vec![]);

    let delta = compiler.update_acl(&before, &after).unwrap();
    assert_eq!(delta.batches.len(), 2);
    assert!(delta.batches[0]
        .flows
        .iter()
        .any(|f| f.op == FlowOp::Remove && f.flow_id.starts_with("egress_Filter_1_42_sg1_ssh")));
    assert!(delta.batches[1]
        .flows
        .iter()
        .all(|f| f.op == FlowOp::Add || f.flow_id.starts_with("egress_Retire")));
    assert!(delta.batches[1]
        .flows
        .iter()
        .any(|f| f.op == FlowOp::Add && f.flow_id.starts_with("egress_Filter_1_42_sg2_ssh")));
}

#[test]
fn test_update_port_security_flip_delegates() {
    let (index, compiler) = compiler(Direction::Egress);
    add_acl(&index, ssh_acl("sg1"), 1);
    let enabled = port("p1", &["sg1"], vec![]);
    let disabled = AclInterfaceBuilder::from_existing(&enabled)
        .port_security_enabled(false)
        .build();

    assert_eq!(
        compiler.update_acl(&enabled, &disabled).unwrap(),
        compiler.remove_acl(&enabled).unwrap()
    );
    assert_eq!(
        compiler.update_acl(&disabled, &enabled).unwrap(),
        compiler.apply_acl(&enabled).unwrap()
    );
    assert!(compiler.update_acl(&disabled, &disabled).unwrap().is_empty());
}
