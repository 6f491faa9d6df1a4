//! Direction profiles.
//!
//! One compiler serves both directions; everything that differs between
//! them is behind [`DirectionProfile`]:
//!
//! - the table ids of the pipeline
//! - how the port is identified (reg6 for egress, metadata for ingress)
//! - which side of the packet is the port's own address and which is the
//!   remote one
//! - the anti-spoofing and subnet rules specific to the direction

use crate::flow::{FlowEntry, FlowOp, MatchInfo};
use crate::matches::{self, *};
use aclservice_types::{
    AllowedAddressPair, Direction, IpPrefix, IpVersion, MacAddress, SubnetInfo,
};
use std::fmt;

/// Table ids of one direction's ACL pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTables {
    pub anti_spoofer: u8,
    pub ct_classifier: u8,
    pub ct_state: u8,
    pub existing_traffic: u8,
    pub filter: u8,
    pub rule_based_filter: u8,
    pub remote_acl: u8,
    pub committer: u8,
    /// Table the pipeline continues in once a packet is admitted.
    pub exit: u8,
}

impl PipelineTables {
    pub const EGRESS: PipelineTables = PipelineTables {
        anti_spoofer: 211,
        ct_classifier: 212,
        ct_state: 213,
        existing_traffic: 214,
        filter: 215,
        rule_based_filter: 216,
        remote_acl: 217,
        committer: 218,
        exit: 17,
    };

    pub const INGRESS: PipelineTables = PipelineTables {
        anti_spoofer: 241,
        ct_classifier: 242,
        ct_state: 243,
        existing_traffic: 244,
        filter: 245,
        rule_based_filter: 246,
        remote_acl: 247,
        committer: 248,
        exit: 220,
    };

    /// The eight ACL tables in pipeline order.
    pub const fn acl_tables(&self) -> [u8; 8] {
        [
            self.anti_spoofer,
            self.ct_classifier,
            self.ct_state,
            self.existing_traffic,
            self.filter,
            self.rule_based_filter,
            self.remote_acl,
            self.committer,
        ]
    }
}

/// Resolved identity of a port being compiled.
#[derive(Debug, Clone, Copy)]
pub struct PortContext<'a> {
    pub interface_id: &'a str,
    pub dp_id: u64,
    pub lport_tag: u32,
    /// Conntrack zone of the port.
    pub elan_id: u64,
    pub profile: &'a dyn DirectionProfile,
}

impl PortContext<'_> {
    /// `<direction>_<role>_<dpn>_<lport>[_<discriminator>]`
    pub fn flow_id(&self, role: &str, discriminator: &str) -> String {
        let mut id = format!(
            "{}_{}_{}_{}",
            self.profile.direction(),
            role,
            self.dp_id,
            self.lport_tag
        );
        if !discriminator.is_empty() {
            id.push('_');
            id.push_str(discriminator);
        }
        id
    }

    /// Flow on this port's switch, pre-filled with the port identity match.
    pub fn port_flow(
        &self,
        table: u8,
        role: &str,
        discriminator: &str,
        priority: u16,
        op: FlowOp,
    ) -> FlowEntry {
        FlowEntry::new(
            self.dp_id,
            table,
            self.flow_id(role, discriminator),
            priority,
        )
        .with_cookie(matches::cookie(table))
        .with_matches(self.profile.lport_matches(self.lport_tag))
        .with_op(op)
    }

    pub fn tables(&self) -> &PipelineTables {
        self.profile.tables()
    }
}

/// Direction-specific behavior of the compiler.
pub trait DirectionProfile: fmt::Debug + Send + Sync {
    fn direction(&self) -> Direction;

    fn tables(&self) -> &PipelineTables;

    /// Port identity match.
    fn lport_matches(&self, lport_tag: u32) -> Vec<MatchInfo>;

    /// Port identity plus remote ACL tag.
    fn lport_remote_tag_matches(&self, lport_tag: u32, remote_tag: u32) -> Vec<MatchInfo>;

    /// Port identity plus the conntrack classifier type.
    fn lport_classifier_matches(&self, lport_tag: u32, kind: CtClassifier) -> Vec<MatchInfo>;

    /// True when the remote peer is the packet source.
    fn remote_is_source(&self) -> bool;

    /// Match on the remote peer's address.
    fn remote_ip_matches(&self, prefix: IpPrefix) -> Vec<MatchInfo> {
        matches::ip_prefix(prefix, self.remote_is_source())
    }

    /// Match on the port's own address.
    fn local_ip_matches(&self, prefix: IpPrefix) -> Vec<MatchInfo> {
        matches::ip_prefix(prefix, !self.remote_is_source())
    }

    /// Match on the port's own MAC.
    fn local_mac_match(&self, mac: MacAddress) -> MatchInfo {
        if self.remote_is_source() {
            MatchInfo::EthDst(mac)
        } else {
            MatchInfo::EthSrc(mac)
        }
    }

    /// Anti-spoofing rules that depend only on the port.
    fn anti_spoof_port_flows(&self, port: &PortContext<'_>, op: FlowOp) -> Vec<FlowEntry>;

    /// Anti-spoofing rules keyed by one of the port's MACs.
    fn anti_spoof_mac_flows(
        &self,
        port: &PortContext<'_>,
        mac: MacAddress,
        op: FlowOp,
    ) -> Vec<FlowEntry>;

    /// Anti-spoofing rules keyed by one allowed address pair.
    fn anti_spoof_aap_flows(
        &self,
        port: &PortContext<'_>,
        aap: &AllowedAddressPair,
        op: FlowOp,
    ) -> Vec<FlowEntry>;

    /// Rules keyed by one of the port's subnets.
    fn subnet_flows(&self, port: &PortContext<'_>, subnet: &SubnetInfo, op: FlowOp)
        -> Vec<FlowEntry>;
}

/// Builds the profile for a direction.
pub fn profile_for(direction: Direction) -> Box<dyn DirectionProfile> {
    match direction {
        Direction::Egress => Box::new(EgressProfile),
        Direction::Ingress => Box::new(IngressProfile),
    }
}

fn aap_discriminator(aap: &AllowedAddressPair) -> String {
    format!("{}_{}", aap.mac, aap.ip)
}

/// Address pair goto-classifier rule shared by both directions.
fn aap_classifier_flow(port: &PortContext<'_>, aap: &AllowedAddressPair, op: FlowOp) -> FlowEntry {
    let profile = port.profile;
    let tables = profile.tables();
    port.port_flow(
        tables.anti_spoofer,
        "AntiSpoof_Aap",
        &aap_discriminator(aap),
        AAP_PRIORITY,
        op,
    )
    .extend_matches([profile.local_mac_match(aap.mac)])
    .extend_matches(profile.local_ip_matches(aap.ip))
    .with_instructions(matches::goto_table(tables.ct_classifier))
}

// ============ Egress ============

/// Traffic sent by the port.
#[derive(Debug, Clone, Copy, Default)]
pub struct EgressProfile;

impl DirectionProfile for EgressProfile {
    fn direction(&self) -> Direction {
        Direction::Egress
    }

    fn tables(&self) -> &PipelineTables {
        &PipelineTables::EGRESS
    }

    fn lport_matches(&self, lport_tag: u32) -> Vec<MatchInfo> {
        vec![MatchInfo::Reg6 {
            value: lport_reg6_value(lport_tag),
            mask: LPORT_REG6_MASK,
        }]
    }

    fn lport_remote_tag_matches(&self, lport_tag: u32, remote_tag: u32) -> Vec<MatchInfo> {
        let mut matches = self.lport_matches(lport_tag);
        matches.push(remote_acl_tag(remote_tag));
        matches
    }

    fn lport_classifier_matches(&self, lport_tag: u32, kind: CtClassifier) -> Vec<MatchInfo> {
        let mut matches = self.lport_matches(lport_tag);
        matches.push(ct_classifier(kind));
        matches
    }

    fn remote_is_source(&self) -> bool {
        false
    }

    fn anti_spoof_port_flows(&self, port: &PortContext<'_>, op: FlowOp) -> Vec<FlowEntry> {
        let tables = self.tables();
        let mut flows = Vec::new();

        // The port must not act as a DHCP server or a router.
        for version in [IpVersion::V4, IpVersion::V6] {
            flows.push(
                port.port_flow(
                    tables.anti_spoofer,
                    "AntiSpoof_DhcpServer_Drop",
                    &version.to_string(),
                    ANTI_SPOOF_DROP_PRIORITY,
                    op,
                )
                .extend_matches(dhcp_server_to_client(version))
                .with_instructions(drop_instructions()),
            );
        }
        flows.push(
            port.port_flow(
                tables.anti_spoofer,
                "AntiSpoof_Icmpv6_Drop",
                &ICMPV6_ROUTER_ADVERTISEMENT.to_string(),
                ANTI_SPOOF_DROP_PRIORITY,
                op,
            )
            .extend_matches(icmpv6_type(ICMPV6_ROUTER_ADVERTISEMENT))
            .with_instructions(drop_instructions()),
        );

        for icmp_type in [
            ICMPV6_ROUTER_SOLICITATION,
            ICMPV6_NEIGHBOR_SOLICITATION,
            ICMPV6_NEIGHBOR_ADVERTISEMENT,
            ICMPV6_MLD2_REPORT,
        ] {
            flows.push(
                port.port_flow(
                    tables.anti_spoofer,
                    "AntiSpoof_Icmpv6_Allow",
                    &icmp_type.to_string(),
                    ANTI_SPOOF_ALLOW_PRIORITY,
                    op,
                )
                .extend_matches(icmpv6_type(icmp_type))
                .with_instructions(next_table(tables.anti_spoofer, tables.exit)),
            );
        }

        // ARP from addresses outside the allowed pairs.
        flows.push(
            port.port_flow(
                tables.anti_spoofer,
                "AntiSpoof_Arp_Drop",
                "",
                ARP_DROP_PRIORITY,
                op,
            )
            .extend_matches([arp()])
            .with_instructions(drop_instructions()),
        );

        flows
    }

    fn anti_spoof_mac_flows(
        &self,
        port: &PortContext<'_>,
        mac: MacAddress,
        op: FlowOp,
    ) -> Vec<FlowEntry> {
        let tables = self.tables();
        let mut flows = Vec::new();

        for version in [IpVersion::V4, IpVersion::V6] {
            flows.push(
                port.port_flow(
                    tables.anti_spoofer,
                    "AntiSpoof_DhcpClient",
                    &format!("{}_{}", mac, version),
                    ANTI_SPOOF_ALLOW_PRIORITY,
                    op,
                )
                .extend_matches([MatchInfo::EthSrc(mac)])
                .extend_matches(dhcp_client_to_server(version))
                .with_instructions(next_table(tables.anti_spoofer, tables.exit)),
            );
        }

        flows.push(
            port.port_flow(
                tables.anti_spoofer,
                "AntiSpoof_L2Broadcast",
                &mac.to_string(),
                L2_BROADCAST_PRIORITY,
                op,
            )
            .extend_matches([MatchInfo::EthSrc(mac), l2_broadcast_dst()])
            .with_instructions(goto_table(tables.ct_classifier)),
        );

        flows
    }

    fn anti_spoof_aap_flows(
        &self,
        port: &PortContext<'_>,
        aap: &AllowedAddressPair,
        op: FlowOp,
    ) -> Vec<FlowEntry> {
        if aap.ip.is_multicast() {
            return Vec::new();
        }

        let tables = self.tables();
        let mut flows = vec![aap_classifier_flow(port, aap, op)];
        if aap.ip.is_ipv4() {
            flows.push(
                port.port_flow(
                    tables.anti_spoofer,
                    "AntiSpoof_Arp",
                    &aap_discriminator(aap),
                    ANTI_SPOOF_ALLOW_PRIORITY,
                    op,
                )
                .extend_matches(arp_sender(aap.mac, aap.ip))
                .with_instructions(next_table(tables.anti_spoofer, tables.exit)),
            );
        }
        flows
    }

    fn subnet_flows(
        &self,
        _port: &PortContext<'_>,
        _subnet: &SubnetInfo,
        _op: FlowOp,
    ) -> Vec<FlowEntry> {
        Vec::new()
    }
}

// ============ Ingress ============

/// Traffic delivered to the port.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngressProfile;

impl DirectionProfile for IngressProfile {
    fn direction(&self) -> Direction {
        Direction::Ingress
    }

    fn tables(&self) -> &PipelineTables {
        &PipelineTables::INGRESS
    }

    fn lport_matches(&self, lport_tag: u32) -> Vec<MatchInfo> {
        vec![MatchInfo::Metadata {
            value: lport_metadata_value(lport_tag),
            mask: LPORT_METADATA_MASK,
        }]
    }

    /// Only one metadata match is addressable here, so both fields are
    /// folded into a single value/mask pair.
    fn lport_remote_tag_matches(&self, lport_tag: u32, remote_tag: u32) -> Vec<MatchInfo> {
        vec![MatchInfo::Metadata {
            value: lport_metadata_value(lport_tag) | remote_acl_tag_metadata_value(remote_tag),
            mask: LPORT_METADATA_MASK | REMOTE_ACL_TAG_MASK,
        }]
    }

    fn lport_classifier_matches(&self, lport_tag: u32, kind: CtClassifier) -> Vec<MatchInfo> {
        vec![MatchInfo::Metadata {
            value: lport_metadata_value(lport_tag) | kind.metadata(),
            mask: LPORT_METADATA_MASK | CT_CLASSIFIER_MASK,
        }]
    }

    fn remote_is_source(&self) -> bool {
        true
    }

    fn anti_spoof_port_flows(&self, port: &PortContext<'_>, op: FlowOp) -> Vec<FlowEntry> {
        let tables = self.tables();
        let mut flows = Vec::new();

        for version in [IpVersion::V4, IpVersion::V6] {
            flows.push(
                port.port_flow(
                    tables.anti_spoofer,
                    "AntiSpoof_DhcpServer",
                    &version.to_string(),
                    ANTI_SPOOF_ALLOW_PRIORITY,
                    op,
                )
                .extend_matches(dhcp_server_to_client(version))
                .with_instructions(next_table(tables.anti_spoofer, tables.exit)),
            );
        }

        for icmp_type in [
            ICMPV6_MLD_QUERY,
            ICMPV6_NEIGHBOR_SOLICITATION,
            ICMPV6_NEIGHBOR_ADVERTISEMENT,
        ] {
            flows.push(
                port.port_flow(
                    tables.anti_spoofer,
                    "AntiSpoof_Icmpv6_Allow",
                    &icmp_type.to_string(),
                    ANTI_SPOOF_ALLOW_PRIORITY,
                    op,
                )
                .extend_matches(icmpv6_type(icmp_type))
                .with_instructions(next_table(tables.anti_spoofer, tables.exit)),
            );
        }

        flows.push(
            port.port_flow(
                tables.anti_spoofer,
                "AntiSpoof_Arp",
                "",
                ANTI_SPOOF_ALLOW_PRIORITY,
                op,
            )
            .extend_matches([arp()])
            .with_instructions(next_table(tables.anti_spoofer, tables.exit)),
        );

        flows
    }

    fn anti_spoof_mac_flows(
        &self,
        _port: &PortContext<'_>,
        _mac: MacAddress,
        _op: FlowOp,
    ) -> Vec<FlowEntry> {
        Vec::new()
    }

    fn anti_spoof_aap_flows(
        &self,
        port: &PortContext<'_>,
        aap: &AllowedAddressPair,
        op: FlowOp,
    ) -> Vec<FlowEntry> {
        if aap.ip.is_multicast() {
            return Vec::new();
        }
        vec![aap_classifier_flow(port, aap, op)]
    }

    fn subnet_flows(
        &self,
        port: &PortContext<'_>,
        subnet: &SubnetInfo,
        op: FlowOp,
    ) -> Vec<FlowEntry> {
        let tables = self.tables();
        let mut flows = Vec::new();

        if let Some(broadcast) = subnet.prefix.broadcast() {
            flows.push(
                port.port_flow(
                    tables.anti_spoofer,
                    "Subnet_Broadcast",
                    &subnet.id,
                    SUBNET_BROADCAST_PRIORITY,
                    op,
                )
                .extend_matches(matches::ip_prefix(IpPrefix::host(broadcast), false))
                .with_instructions(goto_table(tables.ct_classifier)),
            );
        }

        if subnet.prefix.is_ipv6() {
            if let Some(gateway_mac) = subnet.gateway_mac {
                let link_local = IpPrefix::host(gateway_mac.ipv6_link_local());
                flows.push(
                    port.port_flow(
                        tables.anti_spoofer,
                        "Subnet_RouterAdvert",
                        &subnet.id,
                        ANTI_SPOOF_ALLOW_PRIORITY,
                        op,
                    )
                    .extend_matches(icmpv6_type(ICMPV6_ROUTER_ADVERTISEMENT))
                    .extend_matches([MatchInfo::IpSrc(link_local)])
                    .with_instructions(next_table(tables.anti_spoofer, tables.exit)),
                );
            }
        }

        flows
    }
}
