//! IP address and prefix types with safe parsing.

use crate::acl::IpVersion;
use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IP address that can be either IPv4 or IPv6.
///
/// Ordered so that sets of addresses iterate deterministically; every
/// IPv4 address sorts before every IPv6 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpAddress {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl IpAddress {
    /// Returns true if this is an IPv4 address.
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    /// Returns true if this is an IPv6 address.
    pub const fn is_ipv6(&self) -> bool {
        matches!(self, IpAddress::V6(_))
    }

    /// Returns the IP version of this address.
    pub const fn version(&self) -> IpVersion {
        match self {
            IpAddress::V4(_) => IpVersion::V4,
            IpAddress::V6(_) => IpVersion::V6,
        }
    }

    /// Returns true for 224.0.0.0/4 and ff00::/8.
    pub fn is_multicast(&self) -> bool {
        match self {
            IpAddress::V4(addr) => addr.is_multicast(),
            IpAddress::V6(addr) => addr.is_multicast(),
        }
    }

    /// Maximum prefix length for this address family.
    pub const fn max_prefix_len(&self) -> u8 {
        match self {
            IpAddress::V4(_) => 32,
            IpAddress::V6(_) => 128,
        }
    }

    fn masked(&self, prefix_len: u8) -> Self {
        match self {
            IpAddress::V4(addr) => {
                let bits = u32::from(*addr);
                let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
                IpAddress::V4(Ipv4Addr::from(bits & mask))
            }
            IpAddress::V6(addr) => {
                let bits = u128::from(*addr);
                let mask = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
                IpAddress::V6(Ipv6Addr::from(bits & mask))
            }
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(':') {
            s.parse::<Ipv6Addr>()
                .map(IpAddress::V6)
                .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
        } else {
            s.parse::<Ipv4Addr>()
                .map(IpAddress::V4)
                .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
        }
    }
}

impl TryFrom<String> for IpAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpAddress> for String {
    fn from(addr: IpAddress) -> Self {
        addr.to_string()
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(addr)
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(addr)
    }
}

/// An IP prefix in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
///
/// Host bits are cleared on construction, so `10.0.0.7/24` and
/// `10.0.0.0/24` are the same prefix. A bare address parses as a host
/// prefix (/32 or /128).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddress,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddress, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = address.max_prefix_len();
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for {}",
                prefix_len, max_len, address
            )));
        }

        Ok(IpPrefix {
            address: address.masked(prefix_len),
            prefix_len,
        })
    }

    /// Creates a host prefix (/32 or /128) for a single address.
    pub fn host(address: IpAddress) -> Self {
        IpPrefix {
            address,
            prefix_len: address.max_prefix_len(),
        }
    }

    /// Returns the network address of this prefix.
    pub const fn address(&self) -> &IpAddress {
        &self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns the IP version of this prefix.
    pub const fn version(&self) -> IpVersion {
        self.address.version()
    }

    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    pub const fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Returns true if this is a host route (/32 for IPv4, /128 for IPv6).
    pub const fn is_host_route(&self) -> bool {
        self.prefix_len == self.address.max_prefix_len()
    }

    /// Returns true for the "all network" wildcard (0.0.0.0/0 or ::/0).
    pub const fn is_all_network(&self) -> bool {
        self.prefix_len == 0
    }

    /// Returns true if the network address is a multicast address.
    pub fn is_multicast(&self) -> bool {
        self.address.is_multicast()
    }

    /// Directed broadcast address of an IPv4 prefix.
    ///
    /// Returns `None` for IPv6 and for host prefixes, which have no
    /// broadcast address of their own.
    pub fn broadcast(&self) -> Option<IpAddress> {
        match self.address {
            IpAddress::V4(addr) if self.prefix_len < 32 => {
                let host_mask = u32::MAX >> u32::from(self.prefix_len);
                Some(IpAddress::V4(Ipv4Addr::from(u32::from(addr) | host_mask)))
            }
            _ => None,
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.rsplit_once('/') {
            Some((addr_str, len_str)) => {
                let address: IpAddress = addr_str
                    .parse()
                    .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
                let prefix_len: u8 = len_str
                    .parse()
                    .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
                IpPrefix::new(address, prefix_len)
            }
            None => s
                .parse::<IpAddress>()
                .map(IpPrefix::host)
                .map_err(|_| ParseError::InvalidIpPrefix(s.to_string())),
        }
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> Self {
        prefix.to_string()
    }
}

impl From<IpAddress> for IpPrefix {
    fn from(address: IpAddress) -> Self {
        IpPrefix::host(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ip_address_discrimination() {
        let v4: IpAddress = "10.0.0.1".parse().unwrap();
        assert!(v4.is_ipv4());
        assert_eq!(v4.version(), IpVersion::V4);

        let v6: IpAddress = "::1".parse().unwrap();
        assert!(v6.is_ipv6());
        assert_eq!(v6.version(), IpVersion::V6);
    }

    #[test]
    fn test_ipv4_sorts_before_ipv6() {
        let v4: IpAddress = "255.255.255.255".parse().unwrap();
        let v6: IpAddress = "::".parse().unwrap();
        assert!(v4 < v6);
    }

    #[test]
    fn test_prefix_parse_clears_host_bits() {
        let prefix: IpPrefix = "10.0.0.7/24".parse().unwrap();
        assert_eq!(prefix.to_string(), "10.0.0.0/24");
        assert_eq!(prefix, "10.0.0.0/24".parse().unwrap());

        let v6: IpPrefix = "2001:db8::1/32".parse().unwrap();
        assert_eq!(v6.to_string(), "2001:db8::/32");
    }

    #[test]
    fn test_bare_address_is_host_prefix() {
        let prefix: IpPrefix = "10.0.0.5".parse().unwrap();
        assert!(prefix.is_host_route());
        assert_eq!(prefix.to_string(), "10.0.0.5/32");

        let v6: IpPrefix = "fd00::5".parse().unwrap();
        assert_eq!(v6.prefix_len(), 128);
    }

    #[test]
    fn test_all_network() {
        assert!("0.0.0.0/0".parse::<IpPrefix>().unwrap().is_all_network());
        assert!("::/0".parse::<IpPrefix>().unwrap().is_all_network());
        assert!(!"10.0.0.0/8".parse::<IpPrefix>().unwrap().is_all_network());
    }

    #[test]
    fn test_multicast() {
        assert!("224.0.0.1".parse::<IpPrefix>().unwrap().is_multicast());
        assert!("ff02::1".parse::<IpPrefix>().unwrap().is_multicast());
        assert!(!"10.1.1.1".parse::<IpPrefix>().unwrap().is_multicast());
    }

    #[test]
    fn test_broadcast() {
        let prefix: IpPrefix = "192.168.10.0/24".parse().unwrap();
        assert_eq!(prefix.broadcast(), Some("192.168.10.255".parse().unwrap()));

        let host: IpPrefix = "192.168.10.1/32".parse().unwrap();
        assert_eq!(host.broadcast(), None);

        let v6: IpPrefix = "2001:db8::/64".parse().unwrap();
        assert_eq!(v6.broadcast(), None);
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0/abc".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let prefix: IpPrefix = "10.1.0.0/16".parse().unwrap();
        let json = serde_json::to_string(&prefix).unwrap();
        assert_eq!(json, "\"10.1.0.0/16\"");
        let back: IpPrefix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prefix);
    }
}
