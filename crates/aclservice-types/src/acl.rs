//! Security-group model: ACLs, their rules (ACEs) and rule matches.

use crate::ip::IpPrefix;
use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// ACL identifier (the security-group uuid or name).
pub type AclId = String;

/// Traffic direction, relative to the port.
///
/// `Ingress` is traffic delivered *to* the port, `Egress` is traffic sent
/// *from* the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ingress" => Ok(Self::Ingress),
            "egress" => Ok(Self::Egress),
            _ => Err(ParseError::InvalidDirection(s.to_string())),
        }
    }
}

/// IP version of a rule or address pair, doubling as the L2 ether type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    #[serde(alias = "IPv4")]
    V4,
    #[serde(alias = "IPv6")]
    V6,
}

impl IpVersion {
    pub const ETHERTYPE_IPV4: u16 = 0x0800;
    pub const ETHERTYPE_IPV6: u16 = 0x86dd;

    pub const fn ether_type(&self) -> u16 {
        match self {
            Self::V4 => Self::ETHERTYPE_IPV4,
            Self::V6 => Self::ETHERTYPE_IPV6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

/// IP protocol of a rule match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl IpProtocol {
    pub const fn number(&self) -> u8 {
        match self {
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmpv6 => 58,
            Self::Other(n) => *n,
        }
    }

    pub const fn from_number(n: u8) -> Self {
        match n {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            58 => Self::Icmpv6,
            other => Self::Other(other),
        }
    }

    /// Protocols whose sessions the connection tracker follows.
    pub const fn is_conntrack_tracked(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp | Self::Icmp | Self::Icmpv6)
    }

    /// Protocols that carry L4 ports.
    pub const fn has_ports(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }

    pub const fn is_icmp(&self) -> bool {
        matches!(self, Self::Icmp | Self::Icmpv6)
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Icmp => write!(f, "icmp"),
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Icmpv6 => write!(f, "icmpv6"),
            Self::Other(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for IpProtocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "icmp" => Ok(Self::Icmp),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmpv6" | "ipv6-icmp" => Ok(Self::Icmpv6),
            other => other
                .parse::<u8>()
                .map(Self::from_number)
                .map_err(|_| ParseError::InvalidProtocol(s.to_string())),
        }
    }
}

impl TryFrom<String> for IpProtocol {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpProtocol> for String {
    fn from(proto: IpProtocol) -> Self {
        proto.to_string()
    }
}

/// Inclusive L4 port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange")]
pub struct PortRange {
    min: u16,
    max: u16,
}

#[derive(Deserialize)]
struct RawPortRange {
    min: u16,
    max: u16,
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = ParseError;

    fn try_from(raw: RawPortRange) -> Result<Self, Self::Error> {
        PortRange::new(raw.min, raw.max)
    }
}

impl PortRange {
    /// # Errors
    ///
    /// Returns an error if `min > max`.
    pub fn new(min: u16, max: u16) -> Result<Self, ParseError> {
        if min > max {
            return Err(ParseError::InvalidPortRange(format!("{}-{}", min, max)));
        }
        Ok(Self { min, max })
    }

    pub const fn single(port: u16) -> Self {
        Self {
            min: port,
            max: port,
        }
    }

    pub const fn min(&self) -> u16 {
        self.min
    }

    pub const fn max(&self) -> u16 {
        self.max
    }

    /// True for `0-65535`, which constrains nothing.
    pub const fn is_full(&self) -> bool {
        self.min == 0 && self.max == u16::MAX
    }

    /// Splits the range into the minimal list of aligned `(value, mask)`
    /// blocks whose union is exactly the range, lowest value first.
    ///
    /// ```
    /// use aclservice_types::PortRange;
    ///
    /// let blocks = PortRange::new(1000, 1003).unwrap().mask_blocks();
    /// assert_eq!(blocks, vec![(1000, 0xfffc)]);
    /// ```
    pub fn mask_blocks(&self) -> Vec<(u16, u16)> {
        let mut blocks = Vec::new();
        let mut start = u32::from(self.min);
        let end = u32::from(self.max);

        while start <= end {
            // Largest power-of-two block aligned at `start`.
            let mut size: u32 = if start == 0 {
                1 << 16
            } else {
                1 << start.trailing_zeros()
            };
            while start + size - 1 > end {
                size >>= 1;
            }
            let mask = !(size - 1) & 0xffff;
            blocks.push((start as u16, mask as u16));
            start += size;
        }

        blocks
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

impl FromStr for PortRange {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|_| ParseError::InvalidPortRange(s.to_string()))
        };
        match s.split_once('-') {
            Some((lo, hi)) => PortRange::new(parse(lo)?, parse(hi)?),
            None => Ok(PortRange::single(parse(s)?)),
        }
    }
}

/// Packet match of one ACE.
///
/// `remote_group` replaces the remote address: the source prefix for
/// ingress rules and the destination prefix for egress rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct AceMatch {
    pub ethertype: IpVersion,
    pub protocol: Option<IpProtocol>,
    pub src_prefix: Option<IpPrefix>,
    pub dst_prefix: Option<IpPrefix>,
    pub src_ports: Option<PortRange>,
    pub dst_ports: Option<PortRange>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
    pub remote_group: Option<AclId>,
}

/// One rule inside an ACL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ace {
    pub rule_name: String,
    pub direction: Direction,
    #[serde(default, rename = "match")]
    pub matches: AceMatch,
    #[serde(default)]
    pub deleted: bool,
}

impl Ace {
    pub fn new(rule_name: impl Into<String>, direction: Direction) -> Self {
        Self {
            rule_name: rule_name.into(),
            direction,
            matches: AceMatch::default(),
            deleted: false,
        }
    }

    pub fn with_ethertype(mut self, ethertype: IpVersion) -> Self {
        self.matches.ethertype = ethertype;
        self
    }

    pub fn with_protocol(mut self, protocol: IpProtocol) -> Self {
        self.matches.protocol = Some(protocol);
        self
    }

    pub fn with_src_prefix(mut self, prefix: IpPrefix) -> Self {
        self.matches.ethertype = prefix.version();
        self.matches.src_prefix = Some(prefix);
        self
    }

    pub fn with_dst_prefix(mut self, prefix: IpPrefix) -> Self {
        self.matches.ethertype = prefix.version();
        self.matches.dst_prefix = Some(prefix);
        self
    }

    pub fn with_src_ports(mut self, ports: PortRange) -> Self {
        self.matches.src_ports = Some(ports);
        self
    }

    pub fn with_dst_ports(mut self, ports: PortRange) -> Self {
        self.matches.dst_ports = Some(ports);
        self
    }

    pub fn with_icmp(mut self, icmp_type: u8, icmp_code: Option<u8>) -> Self {
        self.matches.icmp_type = Some(icmp_type);
        self.matches.icmp_code = icmp_code;
        self
    }

    pub fn with_remote_group(mut self, acl: impl Into<AclId>) -> Self {
        self.matches.remote_group = Some(acl.into());
        self
    }

    pub fn mark_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    pub fn remote_group(&self) -> Option<&AclId> {
        self.matches.remote_group.as_ref()
    }

    /// True when an absent protocol or a conntrack-tracked one.
    pub fn is_conntrack_tracked(&self) -> bool {
        self.matches
            .protocol
            .map_or(true, |p| p.is_conntrack_tracked())
    }
}

/// A named, ordered set of rules (a security group).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub name: AclId,
    #[serde(default)]
    pub rules: Vec<Ace>,
}

impl Acl {
    pub fn new(name: impl Into<AclId>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, ace: Ace) -> Self {
        self.rules.push(ace);
        self
    }

    pub fn rule(&self, rule_name: &str) -> Option<&Ace> {
        self.rules.iter().find(|r| r.rule_name == rule_name)
    }

    /// Remote groups referenced by live rules of one direction.
    pub fn remote_acl_ids(&self, direction: Direction) -> BTreeSet<AclId> {
        self.rules
            .iter()
            .filter(|r| !r.deleted && r.direction == direction)
            .filter_map(|r| r.matches.remote_group.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_direction_parse_and_display() {
        assert_eq!("INGRESS".parse::<Direction>().unwrap(), Direction::Ingress);
        assert_eq!(Direction::Egress.to_string(), "egress");
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!("tcp".parse::<IpProtocol>().unwrap().number(), 6);
        assert_eq!("17".parse::<IpProtocol>().unwrap(), IpProtocol::Udp);
        assert_eq!("132".parse::<IpProtocol>().unwrap(), IpProtocol::Other(132));
        assert!(IpProtocol::Icmpv6.is_conntrack_tracked());
        assert!(!IpProtocol::Other(132).is_conntrack_tracked());
        assert!("bogus".parse::<IpProtocol>().is_err());
    }

    #[test]
    fn test_port_range_validation() {
        assert!(PortRange::new(10, 5).is_err());
        assert_eq!("80".parse::<PortRange>().unwrap(), PortRange::single(80));
        assert_eq!(
            "1000-2000".parse::<PortRange>().unwrap(),
            PortRange::new(1000, 2000).unwrap()
        );
    }

    #[test]
    fn test_mask_blocks_single_port() {
        assert_eq!(PortRange::single(80).mask_blocks(), vec![(80, 0xffff)]);
    }

    #[test]
    fn test_mask_blocks_full_range() {
        let full = PortRange::new(0, u16::MAX).unwrap();
        assert!(full.is_full());
        assert_eq!(full.mask_blocks(), vec![(0, 0)]);
    }

    #[test]
    fn test_mask_blocks_unaligned() {
        let blocks = PortRange::new(1, 6).unwrap().mask_blocks();
        assert_eq!(
            blocks,
            vec![(1, 0xffff), (2, 0xfffe), (4, 0xfffe), (6, 0xffff)]
        );
    }

    #[test]
    fn test_mask_blocks_cover_range_exactly() {
        let range = PortRange::new(1024, 5000).unwrap();
        let mut covered: Vec<u32> = Vec::new();
        for (value, mask) in range.mask_blocks() {
            let size = u32::from(!mask) + 1;
            covered.extend(u32::from(value)..u32::from(value) + size);
        }
        let expected: Vec<u32> = (1024..=5000).collect();
        assert_eq!(covered, expected);
    }

    #[test]
    fn test_remote_acl_ids_by_direction() {
        let acl = Acl::new("sg1")
            .with_rule(Ace::new("r1", Direction::Ingress).with_remote_group("sg2"))
            .with_rule(Ace::new("r2", Direction::Ingress).with_remote_group("sg3"))
            .with_rule(Ace::new("r3", Direction::Egress).with_remote_group("sg4"))
            .with_rule(
                Ace::new("r4", Direction::Ingress)
                    .with_remote_group("sg5")
                    .mark_deleted(),
            );

        let ingress: Vec<_> = acl.remote_acl_ids(Direction::Ingress).into_iter().collect();
        assert_eq!(ingress, vec!["sg2".to_string(), "sg3".to_string()]);
        assert_eq!(acl.remote_acl_ids(Direction::Egress).len(), 1);
    }

    #[test]
    fn test_prefix_sets_ethertype() {
        let ace = Ace::new("r", Direction::Egress).with_dst_prefix("fd00::/64".parse().unwrap());
        assert_eq!(ace.matches.ethertype, IpVersion::V6);
    }

    #[test]
    fn test_ace_deserialize_defaults() {
        let ace: Ace = serde_json::from_str(
            r#"{"rule_name":"allow-ssh","direction":"ingress",
                "match":{"protocol":"tcp","dst_ports":{"min":22,"max":22}}}"#,
        )
        .unwrap();
        assert_eq!(ace.matches.protocol, Some(IpProtocol::Tcp));
        assert_eq!(ace.matches.ethertype, IpVersion::V4);
        assert!(!ace.deleted);
        assert!(ace.is_conntrack_tracked());
    }
}
