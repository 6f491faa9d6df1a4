//! Match and instruction builders.
//!
//! Pure helpers with no knowledge of direction; the direction-specific
//! choices (which register carries the port, which side of the packet is
//! the remote address) live in [`crate::profile`].

use crate::flow::{ActionInfo, InstructionInfo, MatchInfo};
use aclservice_types::{IpPrefix, IpProtocol, IpVersion, MacAddress};

// ============ Priorities ============

/// Base priority of compiled ACE flows; the owning ACL tag is added on top.
pub const ACE_DEFAULT_PRIORITY: u16 = 1000;

pub const ANTI_SPOOF_DROP_PRIORITY: u16 = 63020;
pub const ANTI_SPOOF_ALLOW_PRIORITY: u16 = 63010;
pub const ARP_DROP_PRIORITY: u16 = 63009;
pub const AAP_PRIORITY: u16 = 61010;
pub const SUBNET_BROADCAST_PRIORITY: u16 = 61008;
pub const L2_BROADCAST_PRIORITY: u16 = 61005;

pub const CT_CLEAR_PRIORITY: u16 = 62040;
pub const CT_UNTRACKED_PRIORITY: u16 = 62030;
pub const CT_EXISTING_RETIRE_PRIORITY: u16 = 62025;
pub const CT_EXISTING_PRIORITY: u16 = 62020;
pub const CT_INVALID_PRIORITY: u16 = 62015;
pub const CLASSIFIER_BROADCAST_PRIORITY: u16 = 61020;
pub const CT_RECIRC_PRIORITY: u16 = 61010;

pub const COMMITTER_PRIORITY: u16 = 100;
pub const REMOTE_ACL_PRIORITY: u16 = ACE_DEFAULT_PRIORITY;

pub const DISPATCHER_NEXT_PRIORITY: u16 = 12;
pub const DISPATCHER_LAST_PRIORITY: u16 = 11;
pub const DISPATCHER_FIRST_PRIORITY: u16 = 10;
pub const RULE_MISS_DROP_PRIORITY: u16 = 5;
pub const TABLE_MISS_PRIORITY: u16 = 0;

pub const COOKIE_ACL_BASE: u64 = 0x690_0000;

// ============ Protocol constants ============

pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const DHCP_SERVER_PORT_V4: u16 = 67;
pub const DHCP_CLIENT_PORT_V4: u16 = 68;
pub const DHCP_CLIENT_PORT_V6: u16 = 546;
pub const DHCP_SERVER_PORT_V6: u16 = 547;

pub const ICMPV6_MLD_QUERY: u8 = 130;
pub const ICMPV6_ROUTER_SOLICITATION: u8 = 133;
pub const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;
pub const ICMPV6_NEIGHBOR_SOLICITATION: u8 = 135;
pub const ICMPV6_NEIGHBOR_ADVERTISEMENT: u8 = 136;
pub const ICMPV6_MLD2_REPORT: u8 = 143;

// ============ Conntrack ============

pub const CT_STATE_NEW: u32 = 0x01;
pub const CT_STATE_ESTABLISHED: u32 = 0x02;
pub const CT_STATE_RELATED: u32 = 0x04;
pub const CT_STATE_REPLY: u32 = 0x08;
pub const CT_STATE_INVALID: u32 = 0x10;
pub const CT_STATE_TRACKED: u32 = 0x20;

/// Mark set on commit; traffic retired by a removed rule is re-marked 0.
pub const CT_MARK_ALLOWED: u32 = 0x1;
pub const CT_MARK_RETIRED: u32 = 0x0;

// ============ Metadata layout ============
//
// reg6:     ........ ....LLLL LLLLLLLL LLLL.... (lport tag, egress)
// metadata: bits 40..59 lport tag (ingress), bits 4..23 remote ACL tag,
//           bit 1 conntrack classifier type.

pub const LPORT_TAG_MAX: u32 = 0xF_FFFF;
pub const LPORT_REG6_SHIFT: u32 = 8;
pub const LPORT_REG6_MASK: u32 = 0x0FFF_FF00;
pub const LPORT_METADATA_SHIFT: u32 = 40;
pub const LPORT_METADATA_MASK: u64 = 0x0FFF_FF00_0000_0000;

pub const REMOTE_ACL_TAG_MAX: u32 = 0xF_FFFF;
pub const REMOTE_ACL_TAG_SHIFT: u32 = 4;
pub const REMOTE_ACL_TAG_MASK: u64 = 0x00FF_FFF0;

pub const CT_CLASSIFIER_MASK: u64 = 0x2;

/// Conntrack classifier type recorded in metadata by filter rules and read
/// back by the committer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtClassifier {
    Conntrack,
    NonConntrack,
}

impl CtClassifier {
    pub const fn metadata(&self) -> u64 {
        match self {
            Self::Conntrack => 0,
            Self::NonConntrack => 0x2,
        }
    }

    pub fn for_protocol(protocol: Option<IpProtocol>) -> Self {
        match protocol {
            Some(p) if !p.is_conntrack_tracked() => Self::NonConntrack,
            _ => Self::Conntrack,
        }
    }
}

pub fn lport_reg6_value(lport_tag: u32) -> u32 {
    (lport_tag << LPORT_REG6_SHIFT) & LPORT_REG6_MASK
}

pub fn lport_metadata_value(lport_tag: u32) -> u64 {
    (u64::from(lport_tag) << LPORT_METADATA_SHIFT) & LPORT_METADATA_MASK
}

pub fn remote_acl_tag_metadata_value(tag: u32) -> u64 {
    (u64::from(tag) << REMOTE_ACL_TAG_SHIFT) & REMOTE_ACL_TAG_MASK
}

// ============ Matches ============

pub fn eth_type(version: IpVersion) -> MatchInfo {
    MatchInfo::EthType(version.ether_type())
}

pub fn arp() -> MatchInfo {
    MatchInfo::EthType(ETHERTYPE_ARP)
}

pub fn ip_proto(protocol: IpProtocol) -> MatchInfo {
    MatchInfo::IpProto(protocol.number())
}

pub fn remote_acl_tag(tag: u32) -> MatchInfo {
    MatchInfo::Metadata {
        value: remote_acl_tag_metadata_value(tag),
        mask: REMOTE_ACL_TAG_MASK,
    }
}

pub fn ct_classifier(kind: CtClassifier) -> MatchInfo {
    MatchInfo::Metadata {
        value: kind.metadata(),
        mask: CT_CLASSIFIER_MASK,
    }
}

/// `ct_state` match; every bit in `mask` is checked, set bits in `state`
/// must be present.
pub fn ct_state(state: u32, mask: u32) -> MatchInfo {
    MatchInfo::CtState { state, mask }
}

pub fn ct_untracked() -> MatchInfo {
    ct_state(0, CT_STATE_TRACKED)
}

pub fn ct_tracked() -> MatchInfo {
    ct_state(CT_STATE_TRACKED, CT_STATE_TRACKED)
}

pub fn ct_mark(value: u32) -> MatchInfo {
    MatchInfo::CtMark {
        value,
        mask: u32::MAX,
    }
}

/// UDP `src -> dst` for one IP version.
pub fn udp_ports(version: IpVersion, src: u16, dst: u16) -> Vec<MatchInfo> {
    vec![
        eth_type(version),
        ip_proto(IpProtocol::Udp),
        MatchInfo::UdpSrc {
            port: src,
            mask: u16::MAX,
        },
        MatchInfo::UdpDst {
            port: dst,
            mask: u16::MAX,
        },
    ]
}

pub fn dhcp_server_to_client(version: IpVersion) -> Vec<MatchInfo> {
    match version {
        IpVersion::V4 => udp_ports(version, DHCP_SERVER_PORT_V4, DHCP_CLIENT_PORT_V4),
        IpVersion::V6 => udp_ports(version, DHCP_SERVER_PORT_V6, DHCP_CLIENT_PORT_V6),
    }
}

pub fn dhcp_client_to_server(version: IpVersion) -> Vec<MatchInfo> {
    match version {
        IpVersion::V4 => udp_ports(version, DHCP_CLIENT_PORT_V4, DHCP_SERVER_PORT_V4),
        IpVersion::V6 => udp_ports(version, DHCP_CLIENT_PORT_V6, DHCP_SERVER_PORT_V6),
    }
}

pub fn icmpv6_type(icmp_type: u8) -> Vec<MatchInfo> {
    vec![
        eth_type(IpVersion::V6),
        ip_proto(IpProtocol::Icmpv6),
        MatchInfo::Icmpv6 {
            icmp_type,
            code: Some(0),
        },
    ]
}

pub fn arp_sender(mac: MacAddress, ip: IpPrefix) -> Vec<MatchInfo> {
    vec![arp(), MatchInfo::ArpSha(mac), MatchInfo::ArpSpa(ip)]
}

/// Ether type plus a source or destination prefix match. All-network
/// prefixes constrain nothing and add only the ether type.
pub fn ip_prefix(prefix: IpPrefix, source: bool) -> Vec<MatchInfo> {
    let mut matches = vec![eth_type(prefix.version())];
    if !prefix.is_all_network() {
        matches.push(if source {
            MatchInfo::IpSrc(prefix)
        } else {
            MatchInfo::IpDst(prefix)
        });
    }
    matches
}

pub fn l2_broadcast_dst() -> MatchInfo {
    MatchInfo::EthDst(MacAddress::BROADCAST)
}

// ============ Instructions ============

pub fn goto_table(table: u8) -> Vec<InstructionInfo> {
    vec![InstructionInfo::GotoTable(table)]
}

pub fn resubmit(table: u8) -> Vec<InstructionInfo> {
    vec![InstructionInfo::ApplyActions(vec![ActionInfo::Resubmit {
        table,
    }])]
}

pub fn drop_instructions() -> Vec<InstructionInfo> {
    vec![InstructionInfo::ApplyActions(vec![ActionInfo::Drop])]
}

/// Continue at `to`: goto when it lies ahead of `from`, resubmit when it
/// lies behind (table ids are not ordered the way the pipeline is).
pub fn next_table(from: u8, to: u8) -> Vec<InstructionInfo> {
    if to > from {
        goto_table(to)
    } else {
        resubmit(to)
    }
}

pub fn write_remote_acl_tag(tag: u32) -> InstructionInfo {
    InstructionInfo::WriteMetadata {
        value: remote_acl_tag_metadata_value(tag),
        mask: REMOTE_ACL_TAG_MASK,
    }
}

pub fn write_ct_classifier(kind: CtClassifier) -> InstructionInfo {
    InstructionInfo::WriteMetadata {
        value: kind.metadata(),
        mask: CT_CLASSIFIER_MASK,
    }
}

/// Recirculate through conntrack into `table`.
pub fn ct_recirc(zone: u64, table: u8) -> Vec<InstructionInfo> {
    vec![InstructionInfo::ApplyActions(vec![ActionInfo::Conntrack {
        commit: false,
        zone,
        table: Some(table),
        mark: None,
    }])]
}

/// Commit with `mark`, then resubmit to `then`.
pub fn ct_commit_resubmit(zone: u64, mark: u32, then: u8) -> Vec<InstructionInfo> {
    vec![InstructionInfo::ApplyActions(vec![
        ActionInfo::Conntrack {
            commit: true,
            zone,
            table: None,
            mark: Some(mark),
        },
        ActionInfo::Resubmit { table: then },
    ])]
}

/// Commit with `mark`, then goto `then`.
pub fn ct_commit_goto(zone: u64, mark: u32, then: u8) -> Vec<InstructionInfo> {
    vec![
        InstructionInfo::ApplyActions(vec![ActionInfo::Conntrack {
            commit: true,
            zone,
            table: None,
            mark: Some(mark),
        }]),
        InstructionInfo::GotoTable(then),
    ]
}

pub fn ct_clear_resubmit(table: u8) -> Vec<InstructionInfo> {
    vec![InstructionInfo::ApplyActions(vec![
        ActionInfo::CtClear,
        ActionInfo::Resubmit { table },
    ])]
}

pub fn cookie(table: u8) -> u64 {
    COOKIE_ACL_BASE + u64::from(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_metadata_fields_disjoint() {
        assert_eq!(LPORT_METADATA_MASK & REMOTE_ACL_TAG_MASK, 0);
        assert_eq!(LPORT_METADATA_MASK & CT_CLASSIFIER_MASK, 0);
        assert_eq!(REMOTE_ACL_TAG_MASK & CT_CLASSIFIER_MASK, 0);
    }

    #[test]
    fn test_field_values_stay_in_mask() {
        assert_eq!(lport_reg6_value(LPORT_TAG_MAX), LPORT_REG6_MASK);
        assert_eq!(lport_metadata_value(LPORT_TAG_MAX), LPORT_METADATA_MASK);
        assert_eq!(
            remote_acl_tag_metadata_value(REMOTE_ACL_TAG_MAX),
            REMOTE_ACL_TAG_MASK
        );
        assert_eq!(lport_reg6_value(42), 42 << 8);
        assert_eq!(remote_acl_tag_metadata_value(7), 0x70);
    }

    #[test]
    fn test_next_table_direction() {
        assert_eq!(next_table(211, 212), vec![InstructionInfo::GotoTable(212)]);
        assert_eq!(
            next_table(218, 17),
            vec![InstructionInfo::ApplyActions(vec![ActionInfo::Resubmit {
                table: 17
            }])]
        );
    }

    #[test]
    fn test_dhcp_port_directions() {
        let v4 = dhcp_client_to_server(IpVersion::V4);
        assert!(v4.contains(&MatchInfo::UdpSrc {
            port: 68,
            mask: 0xffff
        }));
        assert!(v4.contains(&MatchInfo::UdpDst {
            port: 67,
            mask: 0xffff
        }));

        let v6 = dhcp_server_to_client(IpVersion::V6);
        assert!(v6.contains(&MatchInfo::UdpSrc {
            port: 547,
            mask: 0xffff
        }));
        assert!(v6.contains(&MatchInfo::EthType(0x86dd)));
    }

    #[test]
    fn test_all_network_prefix_only_matches_ethertype() {
        let any: IpPrefix = "0.0.0.0/0".parse().unwrap();
        assert_eq!(ip_prefix(any, true), vec![MatchInfo::EthType(0x0800)]);

        let host: IpPrefix = "10.0.0.5/32".parse().unwrap();
        assert_eq!(
            ip_prefix(host, false),
            vec![MatchInfo::EthType(0x0800), MatchInfo::IpDst(host)]
        );
    }

    #[test]
    fn test_ct_classifier_for_protocol() {
        assert_eq!(
            CtClassifier::for_protocol(Some(IpProtocol::Tcp)),
            CtClassifier::Conntrack
        );
        assert_eq!(CtClassifier::for_protocol(None), CtClassifier::Conntrack);
        assert_eq!(
            CtClassifier::for_protocol(Some(IpProtocol::Other(132))),
            CtClassifier::NonConntrack
        );
    }
}
