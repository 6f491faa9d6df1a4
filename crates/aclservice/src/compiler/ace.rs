//! Per-rule compilation.

use super::{AceOp, AclCompiler};
use crate::flow::{FlowEntry, FlowOp, InstructionInfo, MatchInfo};
use crate::matches::{self, CtClassifier, ACE_DEFAULT_PRIORITY, CT_EXISTING_RETIRE_PRIORITY};
use crate::matches::{CT_MARK_ALLOWED, CT_MARK_RETIRED};
use crate::profile::PortContext;
use aclservice_types::{Ace, IpProtocol, PortRange};
use itertools::iproduct;
use tracing::{debug, warn};

/// One match alternative of a rule; port ranges fan out into several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AceMatchSet {
    /// Appended to the flow id; empty for rules that do not fan out.
    pub suffix: String,
    pub matches: Vec<MatchInfo>,
}

impl AclCompiler {
    /// Flows of one rule of `acl` on the port.
    ///
    /// Rules of the other direction yield nothing, and so do deleted rules
    /// being added. A rule whose ACL (or remote group) has no tag yet is
    /// left out until the tag shows up.
    pub(crate) fn ace_flows(
        &self,
        port: &PortContext<'_>,
        acl: &str,
        ace: &Ace,
        op: AceOp,
    ) -> Vec<FlowEntry> {
        if ace.direction != self.direction() {
            return Vec::new();
        }
        if ace.deleted && op.is_add() {
            debug!(acl, rule = %ace.rule_name, "skipping deleted rule");
            return Vec::new();
        }

        let Some(acl_tag) = self.index.get_tag(acl) else {
            debug!(acl, rule = %ace.rule_name, "ACL has no tag yet, rule deferred");
            return Vec::new();
        };
        let Some(priority) = u16::try_from(acl_tag)
            .ok()
            .and_then(|tag| ACE_DEFAULT_PRIORITY.checked_add(tag))
        else {
            warn!(acl, tag = acl_tag, "ACL tag does not fit the priority range");
            return Vec::new();
        };

        let remote_tag = match ace.remote_group() {
            Some(remote) => match self.remote_tag(remote) {
                Some(tag) => Some(tag),
                None => {
                    debug!(acl, rule = %ace.rule_name, remote = %remote, "remote group rule deferred");
                    return Vec::new();
                }
            },
            None => None,
        };

        let tables = port.tables();
        let rule_id = format!("{}_{}", acl, ace.rule_name);
        let classifier = matches::write_ct_classifier(CtClassifier::for_protocol(ace.matches.protocol));
        let mut flows = Vec::new();

        for set in self.ace_match_sets(ace) {
            let discriminator = if set.suffix.is_empty() {
                rule_id.clone()
            } else {
                format!("{}_{}", rule_id, set.suffix)
            };

            let flow = match remote_tag {
                None => port
                    .port_flow(tables.filter, "Filter", &discriminator, priority, op.rule_op())
                    .extend_matches(set.matches.iter().cloned())
                    .with_instructions(vec![
                        classifier.clone(),
                        InstructionInfo::GotoTable(tables.committer),
                    ]),
                Some(tag) => port
                    .port_flow(
                        tables.rule_based_filter,
                        "Rbf",
                        &discriminator,
                        priority,
                        op.rule_op(),
                    )
                    .with_matches(self.profile.lport_remote_tag_matches(port.lport_tag, tag))
                    .extend_matches(set.matches.iter().cloned())
                    .with_instructions(vec![
                        classifier.clone(),
                        InstructionInfo::GotoTable(tables.remote_acl),
                    ]),
            };
            flows.push(flow);

            if let Some(retire_op) = op.retire_op() {
                if ace.is_conntrack_tracked() {
                    flows.push(self.retire_flow(port, &discriminator, ace, &set, retire_op));
                }
            }
        }

        flows
    }

    /// Existing-traffic flow that re-marks sessions admitted by a removed
    /// rule so they are filtered again, aging out after the protocol's
    /// idle timeout.
    fn retire_flow(
        &self,
        port: &PortContext<'_>,
        discriminator: &str,
        ace: &Ace,
        set: &AceMatchSet,
        op: FlowOp,
    ) -> FlowEntry {
        let tables = port.tables();
        port.port_flow(
            tables.existing_traffic,
            "Retire",
            discriminator,
            CT_EXISTING_RETIRE_PRIORITY,
            op,
        )
        .extend_matches(set.matches.iter().cloned())
        .extend_matches([matches::ct_tracked(), matches::ct_mark(CT_MARK_ALLOWED)])
        .with_instructions(matches::ct_commit_goto(port.elan_id, CT_MARK_RETIRED, tables.filter))
        .with_hard_timeout(self.timeouts.idle_timeout(ace.matches.protocol))
    }

    /// Packet matches of a rule. Remote group rules leave out the remote
    /// address, which the remote ACL table checks instead.
    pub(crate) fn ace_match_sets(&self, ace: &Ace) -> Vec<AceMatchSet> {
        let m = &ace.matches;
        let remote = m.remote_group.is_some();
        let remote_is_source = self.profile.remote_is_source();

        let mut base = vec![matches::eth_type(m.ethertype)];
        if let Some(protocol) = m.protocol {
            base.push(matches::ip_proto(protocol));
        }
        if let Some(prefix) = m.src_prefix {
            if !(remote && remote_is_source) && !prefix.is_all_network() {
                base.push(MatchInfo::IpSrc(prefix));
            }
        }
        if let Some(prefix) = m.dst_prefix {
            if !(remote && !remote_is_source) && !prefix.is_all_network() {
                base.push(MatchInfo::IpDst(prefix));
            }
        }

        match (m.protocol, m.icmp_type) {
            (Some(IpProtocol::Icmp), Some(icmp_type)) => base.push(MatchInfo::Icmpv4 {
                icmp_type,
                code: m.icmp_code,
            }),
            (Some(IpProtocol::Icmpv6), Some(icmp_type)) => base.push(MatchInfo::Icmpv6 {
                icmp_type,
                code: m.icmp_code,
            }),
            _ => {}
        }

        let Some(protocol) = m.protocol.filter(IpProtocol::has_ports) else {
            return vec![AceMatchSet {
                suffix: String::new(),
                matches: base,
            }];
        };

        let src_blocks = port_blocks(m.src_ports);
        let dst_blocks = port_blocks(m.dst_ports);
        iproduct!(src_blocks.iter(), dst_blocks.iter())
            .map(|(src, dst)| {
                let mut matches = base.clone();
                let mut suffix = Vec::new();
                if let Some((port, mask)) = *src {
                    matches.push(l4_match(protocol, true, port, mask));
                    suffix.push(format!("src{}/{:#x}", port, mask));
                }
                if let Some((port, mask)) = *dst {
                    matches.push(l4_match(protocol, false, port, mask));
                    suffix.push(format!("dst{}/{:#x}", port, mask));
                }
                AceMatchSet {
                    suffix: suffix.join("_"),
                    matches,
                }
            })
            .collect()
    }
}

/// Aligned blocks of a port range; a single `None` when unconstrained.
fn port_blocks(range: Option<PortRange>) -> Vec<Option<(u16, u16)>> {
    match range {
        Some(range) if !range.is_full() => range.mask_blocks().into_iter().map(Some).collect(),
        _ => vec![None],
    }
}

fn l4_match(protocol: IpProtocol, source: bool, port: u16, mask: u16) -> MatchInfo {
    match (protocol, source) {
        (IpProtocol::Udp, true) => MatchInfo::UdpSrc { port, mask },
        (IpProtocol::Udp, false) => MatchInfo::UdpDst { port, mask },
        (_, true) => MatchInfo::TcpSrc { port, mask },
        (_, false) => MatchInfo::TcpDst { port, mask },
    }
}
