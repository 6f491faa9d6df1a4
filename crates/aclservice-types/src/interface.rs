//! Per-port ACL state.

use crate::acl::{AclId, IpVersion};
use crate::ip::{IpAddress, IpPrefix};
use crate::mac::MacAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An (IP prefix, MAC) pair a port may source or receive traffic as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllowedAddressPair {
    pub ip: IpPrefix,
    pub mac: MacAddress,
}

impl AllowedAddressPair {
    pub fn new(ip: IpPrefix, mac: MacAddress) -> Self {
        Self { ip, mac }
    }

    /// Natural key used when diffing address pair sets.
    pub fn key(&self) -> (IpPrefix, MacAddress) {
        (self.ip, self.mac)
    }

    pub fn version(&self) -> IpVersion {
        self.ip.version()
    }
}

/// A subnet the port has an address in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubnetInfo {
    pub id: String,
    pub prefix: IpPrefix,
    #[serde(default)]
    pub gateway_ip: Option<IpAddress>,
    #[serde(default)]
    pub gateway_mac: Option<MacAddress>,
}

impl SubnetInfo {
    pub fn new(id: impl Into<String>, prefix: IpPrefix) -> Self {
        Self {
            id: id.into(),
            prefix,
            gateway_ip: None,
            gateway_mac: None,
        }
    }

    pub fn with_gateway(mut self, ip: IpAddress, mac: MacAddress) -> Self {
        self.gateway_ip = Some(ip);
        self.gateway_mac = Some(mac);
        self
    }
}

/// Immutable snapshot of a port's ACL-relevant state.
///
/// Values are never mutated in place; changes go through
/// [`AclInterfaceBuilder`] seeded from the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclInterface {
    interface_id: String,
    #[serde(default)]
    dp_id: Option<u64>,
    #[serde(default)]
    lport_tag: Option<u32>,
    #[serde(default)]
    port_security_enabled: bool,
    #[serde(default)]
    security_groups: Option<Vec<AclId>>,
    #[serde(default)]
    allowed_address_pairs: Vec<AllowedAddressPair>,
    #[serde(default)]
    subnets: Vec<SubnetInfo>,
    #[serde(default)]
    elan_id: Option<u64>,
    #[serde(skip)]
    marked_for_delete: bool,
}

impl AclInterface {
    pub fn builder(interface_id: impl Into<String>) -> AclInterfaceBuilder {
        AclInterfaceBuilder::new(interface_id)
    }

    pub fn interface_id(&self) -> &str {
        &self.interface_id
    }

    pub fn dp_id(&self) -> Option<u64> {
        self.dp_id
    }

    pub fn lport_tag(&self) -> Option<u32> {
        self.lport_tag
    }

    pub fn is_port_security_enabled(&self) -> bool {
        self.port_security_enabled
    }

    /// `None` when security groups were never populated, which is different
    /// from an explicitly empty list.
    pub fn security_groups(&self) -> Option<&[AclId]> {
        self.security_groups.as_deref()
    }

    pub fn allowed_address_pairs(&self) -> &[AllowedAddressPair] {
        &self.allowed_address_pairs
    }

    pub fn subnets(&self) -> &[SubnetInfo] {
        &self.subnets
    }

    pub fn elan_id(&self) -> Option<u64> {
        self.elan_id
    }

    pub fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete
    }

    pub fn is_member_of(&self, acl: &str) -> bool {
        self.security_groups
            .as_ref()
            .is_some_and(|sgs| sgs.iter().any(|sg| sg == acl))
    }

    /// Ether types present among the port's address pairs.
    pub fn ether_types(&self) -> BTreeSet<IpVersion> {
        self.allowed_address_pairs
            .iter()
            .map(AllowedAddressPair::version)
            .collect()
    }

    /// Distinct MACs among the port's address pairs.
    pub fn macs(&self) -> BTreeSet<MacAddress> {
        self.allowed_address_pairs.iter().map(|aap| aap.mac).collect()
    }
}

/// Mutable builder for [`AclInterface`].
#[derive(Debug, Clone, Default)]
pub struct AclInterfaceBuilder {
    inner: AclInterface,
}

impl AclInterfaceBuilder {
    pub fn new(interface_id: impl Into<String>) -> Self {
        Self {
            inner: AclInterface {
                interface_id: interface_id.into(),
                ..AclInterface::default()
            },
        }
    }

    /// Seeds a builder from an existing snapshot.
    pub fn from_existing(existing: &AclInterface) -> Self {
        Self {
            inner: existing.clone(),
        }
    }

    pub fn dp_id(mut self, dp_id: Option<u64>) -> Self {
        self.inner.dp_id = dp_id;
        self
    }

    pub fn lport_tag(mut self, lport_tag: Option<u32>) -> Self {
        self.inner.lport_tag = lport_tag;
        self
    }

    pub fn port_security_enabled(mut self, enabled: bool) -> Self {
        self.inner.port_security_enabled = enabled;
        self
    }

    pub fn security_groups(mut self, groups: Option<Vec<AclId>>) -> Self {
        self.inner.security_groups = groups;
        self
    }

    pub fn allowed_address_pairs(mut self, aaps: Vec<AllowedAddressPair>) -> Self {
        self.inner.allowed_address_pairs = aaps;
        self
    }

    pub fn subnets(mut self, subnets: Vec<SubnetInfo>) -> Self {
        self.inner.subnets = subnets;
        self
    }

    pub fn elan_id(mut self, elan_id: Option<u64>) -> Self {
        self.inner.elan_id = elan_id;
        self
    }

    pub fn marked_for_delete(mut self, marked: bool) -> Self {
        self.inner.marked_for_delete = marked;
        self
    }

    // In-place setters for closure-style mutators.

    pub fn set_dp_id(&mut self, dp_id: Option<u64>) {
        self.inner.dp_id = dp_id;
    }

    pub fn set_lport_tag(&mut self, lport_tag: Option<u32>) {
        self.inner.lport_tag = lport_tag;
    }

    pub fn set_port_security_enabled(&mut self, enabled: bool) {
        self.inner.port_security_enabled = enabled;
    }

    pub fn set_security_groups(&mut self, groups: Option<Vec<AclId>>) {
        self.inner.security_groups = groups;
    }

    pub fn set_allowed_address_pairs(&mut self, aaps: Vec<AllowedAddressPair>) {
        self.inner.allowed_address_pairs = aaps;
    }

    pub fn set_subnets(&mut self, subnets: Vec<SubnetInfo>) {
        self.inner.subnets = subnets;
    }

    pub fn set_elan_id(&mut self, elan_id: Option<u64>) {
        self.inner.elan_id = elan_id;
    }

    pub fn set_marked_for_delete(&mut self, marked: bool) {
        self.inner.marked_for_delete = marked;
    }

    /// Copies every field except the id and delete marker from `other`.
    pub fn assign_from(&mut self, other: &AclInterface) {
        let id = std::mem::take(&mut self.inner.interface_id);
        let marked = self.inner.marked_for_delete;
        self.inner = AclInterface {
            interface_id: id,
            marked_for_delete: marked,
            ..other.clone()
        };
    }

    pub fn build(self) -> AclInterface {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn aap(ip: &str, mac: &str) -> AllowedAddressPair {
        AllowedAddressPair::new(ip.parse().unwrap(), mac.parse().unwrap())
    }

    #[test]
    fn test_builder_defaults() {
        let port = AclInterface::builder("port-1").build();
        assert_eq!(port.interface_id(), "port-1");
        assert_eq!(port.dp_id(), None);
        assert_eq!(port.security_groups(), None);
        assert!(!port.is_port_security_enabled());
        assert!(!port.is_marked_for_delete());
    }

    #[test]
    fn test_from_existing_preserves_fields() {
        let port = AclInterface::builder("port-1")
            .dp_id(Some(1))
            .lport_tag(Some(42))
            .security_groups(Some(vec!["sg1".into()]))
            .build();

        let mut builder = AclInterfaceBuilder::from_existing(&port);
        builder.set_elan_id(Some(5000));
        let updated = builder.build();

        assert_eq!(updated.lport_tag(), Some(42));
        assert_eq!(updated.elan_id(), Some(5000));
        assert!(updated.is_member_of("sg1"));
        assert!(!updated.is_member_of("sg2"));
        // Original snapshot untouched.
        assert_eq!(port.elan_id(), None);
    }

    #[test]
    fn test_assign_from_keeps_identity() {
        let incoming = AclInterface::builder("other")
            .dp_id(Some(7))
            .marked_for_delete(false)
            .build();
        let mut builder = AclInterfaceBuilder::new("port-1").marked_for_delete(true);
        builder.assign_from(&incoming);
        let merged = builder.build();

        assert_eq!(merged.interface_id(), "port-1");
        assert_eq!(merged.dp_id(), Some(7));
        assert!(merged.is_marked_for_delete());
    }

    #[test]
    fn test_ether_types_and_macs() {
        let port = AclInterface::builder("port-1")
            .allowed_address_pairs(vec![
                aap("10.0.0.5/32", "fa:16:3e:00:00:01"),
                aap("10.0.0.6/32", "fa:16:3e:00:00:01"),
                aap("fd00::5/128", "fa:16:3e:00:00:02"),
            ])
            .build();

        assert_eq!(
            port.ether_types().into_iter().collect::<Vec<_>>(),
            vec![IpVersion::V4, IpVersion::V6]
        );
        assert_eq!(port.macs().len(), 2);
    }

    #[test]
    fn test_deserialize_port() {
        let port: AclInterface = serde_json::from_str(
            r#"{"interface_id":"p1","dp_id":1,"lport_tag":10,
                "port_security_enabled":true,
                "security_groups":["sg1"],
                "allowed_address_pairs":[{"ip":"10.0.0.5","mac":"fa:16:3e:00:00:01"}]}"#,
        )
        .unwrap();
        assert_eq!(port.allowed_address_pairs()[0].ip.to_string(), "10.0.0.5/32");
        assert!(port.subnets().is_empty());
    }
}
