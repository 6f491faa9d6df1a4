//! Shared types for the ACL flow compiler.
//!
//! This crate holds the plain data the compiler consumes:
//!
//! - [`MacAddress`], [`IpAddress`], [`IpPrefix`]: network primitives with
//!   safe parsing and `serde` string representations
//! - [`Acl`], [`Ace`], [`AceMatch`]: the declarative security-group model
//! - [`AclInterface`]: the computed per-port state (switch, lport tag,
//!   security groups, allowed address pairs, subnets)
//!
//! Nothing in here knows about flow tables; see the `aclservice` crate.

mod acl;
mod interface;
mod ip;
mod mac;

pub use acl::{Ace, AceMatch, Acl, AclId, Direction, IpProtocol, IpVersion, PortRange};
pub use interface::{AclInterface, AclInterfaceBuilder, AllowedAddressPair, SubnetInfo};
pub use ip::{IpAddress, IpPrefix};
pub use mac::MacAddress;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid port range: {0}")]
    InvalidPortRange(String),

    #[error("unknown direction: {0}")]
    InvalidDirection(String),

    #[error("unknown IP protocol: {0}")]
    InvalidProtocol(String),
}
