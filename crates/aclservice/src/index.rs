//! ACL index.
//!
//! Reverse lookups the compiler needs on every pass:
//!
//! - ACL name -> definition
//! - ACL id -> member interfaces (keyed by interface id, so re-indexing a
//!   port replaces its snapshot)
//! - (direction, remote ACL id) -> ACLs referencing it as remote group
//! - ACL name -> numeric tag
//! - (ACL id, IP prefix) -> ports holding that prefix, for the overlapping
//!   address guard
//!
//! All maps are [`DashMap`]s; writers on different keys never contend.
//! A missing ACL or tag is a normal "not synchronized yet" state and is
//! reported as `None`, never as an error.

use aclservice_types::{Acl, AclId, AclInterface, Direction, IpPrefix};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Shared ACL lookup tables.
#[derive(Debug, Default)]
pub struct AclDataIndex {
    acls: DashMap<AclId, Arc<Acl>>,
    acl_interfaces: DashMap<AclId, BTreeMap<String, AclInterface>>,
    remote_acls: DashMap<(Direction, AclId), BTreeSet<AclId>>,
    tags: DashMap<AclId, u32>,
    ip_prefixes: DashMap<(AclId, IpPrefix), BTreeSet<String>>,
}

impl AclDataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    // ============ ACL definitions ============

    pub fn put_acl(&self, acl: Acl) {
        debug!(acl = %acl.name, rules = acl.rules.len(), "indexing ACL");
        self.acls.insert(acl.name.clone(), Arc::new(acl));
    }

    pub fn remove_acl(&self, name: &str) -> Option<Arc<Acl>> {
        self.acls.remove(name).map(|(_, acl)| acl)
    }

    pub fn get_acl(&self, name: &str) -> Option<Arc<Acl>> {
        self.acls.get(name).map(|acl| Arc::clone(acl.value()))
    }

    // ============ Interface membership ============

    /// Records the port as a member of each of its security groups, along
    /// with its address pair prefixes.
    pub fn index_interface(&self, port: &AclInterface) {
        let Some(groups) = port.security_groups() else {
            return;
        };
        for acl in groups {
            self.acl_interfaces
                .entry(acl.clone())
                .or_default()
                .insert(port.interface_id().to_string(), port.clone());
            for aap in port.allowed_address_pairs() {
                self.ip_prefixes
                    .entry((acl.clone(), aap.ip))
                    .or_default()
                    .insert(port.interface_id().to_string());
            }
        }
    }

    /// Drops the port from the given ACLs and from their prefix sets.
    pub fn deindex_interface(&self, acl_ids: &[AclId], port: &AclInterface) {
        let prefixes: Vec<IpPrefix> = port.allowed_address_pairs().iter().map(|a| a.ip).collect();
        for acl in acl_ids {
            let now_empty = match self.acl_interfaces.get_mut(acl) {
                Some(mut members) => {
                    members.remove(port.interface_id());
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.acl_interfaces.remove_if(acl, |_, members| members.is_empty());
            }
        }
        self.deindex_ip_prefixes(acl_ids, port.interface_id(), &prefixes);
    }

    /// Drops `port_id` from the (ACL, prefix) sets.
    pub fn deindex_ip_prefixes(&self, acl_ids: &[AclId], port_id: &str, prefixes: &[IpPrefix]) {
        for acl in acl_ids {
            for prefix in prefixes {
                let key = (acl.clone(), *prefix);
                let now_empty = match self.ip_prefixes.get_mut(&key) {
                    Some(mut ports) => {
                        ports.remove(port_id);
                        ports.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.ip_prefixes.remove_if(&key, |_, ports| ports.is_empty());
                }
            }
        }
    }

    /// Current member interfaces of an ACL, ordered by interface id.
    pub fn interfaces(&self, acl: &str) -> Vec<AclInterface> {
        self.acl_interfaces
            .get(acl)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Ports holding `prefix` as an address pair under `acl`.
    pub fn ports_for_ip_prefix(&self, acl: &str, prefix: IpPrefix) -> BTreeSet<String> {
        self.ip_prefixes
            .get(&(acl.to_string(), prefix))
            .map(|ports| ports.clone())
            .unwrap_or_default()
    }

    // ============ Remote ACL references ============

    /// Records every remote group `acl` references, per direction.
    pub fn index_remote_acl(&self, acl: &Acl) {
        for direction in Direction::ALL {
            for remote in acl.remote_acl_ids(direction) {
                self.remote_acls
                    .entry((direction, remote))
                    .or_default()
                    .insert(acl.name.clone());
            }
        }
    }

    pub fn deindex_remote_acl(&self, acl: &Acl) {
        for direction in Direction::ALL {
            for remote in acl.remote_acl_ids(direction) {
                let key = (direction, remote);
                let now_empty = match self.remote_acls.get_mut(&key) {
                    Some(mut acls) => {
                        acls.remove(&acl.name);
                        acls.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.remote_acls.remove_if(&key, |_, acls| acls.is_empty());
                }
            }
        }
    }

    /// ACLs referencing `remote` as remote group in `direction`.
    pub fn get_remote_acl(&self, remote: &str, direction: Direction) -> Option<BTreeSet<AclId>> {
        self.remote_acls
            .get(&(direction, remote.to_string()))
            .map(|acls| acls.clone())
    }

    /// For every ACL referencing `remote` in `direction`, its current
    /// member interfaces.
    pub fn get_remote_acl_interfaces(
        &self,
        remote: &str,
        direction: Direction,
    ) -> BTreeMap<AclId, Vec<AclInterface>> {
        // Clone the id set first; no shard lock is held across lookups.
        let Some(acls) = self.get_remote_acl(remote, direction) else {
            return BTreeMap::new();
        };
        acls.into_iter()
            .map(|acl| {
                let members = self.interfaces(&acl);
                (acl, members)
            })
            .collect()
    }

    // ============ Tags ============

    pub fn set_tag(&self, acl: &str, tag: u32) {
        self.tags.insert(acl.to_string(), tag);
    }

    pub fn get_tag(&self, acl: &str) -> Option<u32> {
        self.tags.get(acl).map(|tag| *tag)
    }

    pub fn clear_tag(&self, acl: &str) -> Option<u32> {
        self.tags.remove(acl).map(|(_, tag)| tag)
    }
}
