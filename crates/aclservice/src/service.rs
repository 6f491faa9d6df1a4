//! ACL service facade.
//!
//! Wires port, ACL and switch events to the per-direction compilers and
//! hands the resulting deltas to the flow installer. Every entry point
//! returns `bool`: failures are logged and never stop the event stream.
//!
//! Index maintenance follows the compile: flows that are being removed are
//! computed while the port is still indexed, so the shared remote ACL flows
//! see it as a current holder, and the port is deindexed afterwards.

use crate::cache::{AclInterfaceCache, RemoveOutcome};
use crate::compiler::AclCompiler;
use crate::config::AclServiceConfig;
use crate::default_tables::DefaultTableBuilder;
use crate::error::{AclServiceError, Result};
use crate::flow::{FlowDelta, FlowOp};
use crate::index::AclDataIndex;
use crate::installer::{ElanResolver, FlowInstaller, TagAllocator};
use aclservice_types::{Ace, Acl, AclId, AclInterface, Direction, IpPrefix};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Counters of submitted work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AclServiceStats {
    /// Batches handed to the installer.
    pub batches_submitted: u64,
    pub flows_added: u64,
    pub flows_removed: u64,
    /// Operations that failed for a reason other than missing state.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    batches_submitted: AtomicU64,
    flows_added: AtomicU64,
    flows_removed: AtomicU64,
    errors: AtomicU64,
}

/// Event-driven front end of the ACL compiler.
pub struct AclService {
    config: AclServiceConfig,
    index: Arc<AclDataIndex>,
    cache: AclInterfaceCache,
    /// One compiler per direction, in [`Direction::ALL`] order.
    compilers: [AclCompiler; 2],
    tags: Arc<dyn TagAllocator>,
    elan: Arc<dyn ElanResolver>,
    installer: Arc<dyn FlowInstaller>,
    stats: StatCounters,
}

impl fmt::Debug for AclService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AclService")
            .field("config", &self.config)
            .field("ports", &self.cache.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl AclService {
    pub fn new(
        config: AclServiceConfig,
        tags: Arc<dyn TagAllocator>,
        elan: Arc<dyn ElanResolver>,
        installer: Arc<dyn FlowInstaller>,
    ) -> Self {
        let index = Arc::new(AclDataIndex::new());
        let compilers = Direction::ALL
            .map(|direction| AclCompiler::new(direction, Arc::clone(&index), config.timeouts.clone()));
        Self {
            config,
            index,
            cache: AclInterfaceCache::new(),
            compilers,
            tags,
            elan,
            installer,
            stats: StatCounters::default(),
        }
    }

    pub fn config(&self) -> &AclServiceConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<AclDataIndex> {
        &self.index
    }

    pub fn cache(&self) -> &AclInterfaceCache {
        &self.cache
    }

    pub fn compiler(&self, direction: Direction) -> &AclCompiler {
        match direction {
            Direction::Ingress => &self.compilers[0],
            Direction::Egress => &self.compilers[1],
        }
    }

    pub fn stats(&self) -> AclServiceStats {
        AclServiceStats {
            batches_submitted: self.stats.batches_submitted.load(Ordering::Relaxed),
            flows_added: self.stats.flows_added.load(Ordering::Relaxed),
            flows_removed: self.stats.flows_removed.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    // ============ Switch events ============

    /// Installs the baseline tables of both directions on a new switch.
    pub fn on_switch_up(&self, dp_id: u64) -> bool {
        let key = format!("dpn-{}", dp_id);
        let mut delta = FlowDelta::new();
        for compiler in &self.compilers {
            let builder = DefaultTableBuilder::new(compiler.profile(), self.config.default_behavior);
            delta.push(key.clone(), builder.flows(dp_id));
        }
        info!(dpn = dp_id, flows = delta.len(), "programming default ACL tables");
        self.report("switch up", &key, self.submit(delta))
    }

    // ============ Port events ============

    /// A port appeared or was bound to a switch.
    pub fn on_port_bound(&self, port: &AclInterface) -> bool {
        self.report("port bound", port.interface_id(), self.bind_port(port))
    }

    /// A port's binding, security groups, address pairs or subnets changed.
    pub fn on_port_updated(&self, port: &AclInterface) -> bool {
        self.report("port updated", port.interface_id(), self.update_port(port))
    }

    /// A port went away. The first call removes its flows and marks it in
    /// the cache, a second call evicts it.
    pub fn on_port_unbound(&self, interface_id: &str) -> bool {
        self.report("port unbound", interface_id, self.unbind_port(interface_id))
    }

    fn bind_port(&self, port: &AclInterface) -> Result<()> {
        let elan_id = port
            .elan_id()
            .or_else(|| self.elan.elan_id(port.interface_id()));
        let port = self.cache.add_or_update(port.interface_id(), |builder| {
            builder.assign_from(port);
            builder.set_elan_id(elan_id);
            builder.set_marked_for_delete(false);
        });

        if !port.is_port_security_enabled() {
            debug!(port = port.interface_id(), "port security disabled, nothing to program");
            return Ok(());
        }
        self.check_bound(&port)?;
        self.index.index_interface(&port);

        let mut delta = FlowDelta::new();
        for compiler in &self.compilers {
            delta.append(compiler.apply_acl(&port)?);
        }
        self.submit(delta)
    }

    fn update_port(&self, port: &AclInterface) -> Result<()> {
        let id = port.interface_id();
        let Some(before) = self.cache.get(id) else {
            debug!(port = id, "update for unknown port, binding it");
            return self.bind_port(port);
        };
        if before.is_marked_for_delete() {
            debug!(port = id, "port is being removed, ignoring update");
            return Ok(());
        }

        let elan_id = port
            .elan_id()
            .or(before.elan_id())
            .or_else(|| self.elan.elan_id(id));
        let (after, changed) = self
            .cache
            .update_if_present(id, |builder| {
                builder.assign_from(port);
                builder.set_elan_id(elan_id);
            })
            .ok_or_else(|| AclServiceError::port_not_found(id))?;
        if !changed {
            debug!(port = id, "port unchanged");
            return Ok(());
        }

        let mut delta = FlowDelta::new();
        // The elan is the conntrack zone of every conntrack flow, and a port
        // without one was never programmed.
        if before.dp_id() != after.dp_id()
            || before.lport_tag() != after.lport_tag()
            || before.elan_id() != after.elan_id()
        {
            info!(
                port = id,
                dpn_before = ?before.dp_id(),
                dpn = ?after.dp_id(),
                elan = ?after.elan_id(),
                "port binding changed, reprogramming"
            );
            if before.is_port_security_enabled() && self.check_bound(&before).is_ok() {
                for compiler in &self.compilers {
                    delta.append(compiler.remove_acl(&before)?);
                }
            }
            self.index.deindex_interface(&groups(&before), &before);
            if after.is_port_security_enabled() {
                self.check_bound(&after)?;
                self.index.index_interface(&after);
                for compiler in &self.compilers {
                    delta.append(compiler.apply_acl(&after)?);
                }
            }
            return self.submit(delta);
        }

        if after.is_port_security_enabled() {
            self.check_bound(&after)?;
            self.index.index_interface(&after);
        }
        for compiler in &self.compilers {
            delta.append(compiler.update_acl(&before, &after)?);
        }
        self.deindex_stale(&before, &after);
        self.submit(delta)
    }

    /// Drops index entries `after` no longer backs: everything when port
    /// security is off, otherwise removed ACLs and, under kept ACLs,
    /// removed address prefixes.
    fn deindex_stale(&self, before: &AclInterface, after: &AclInterface) {
        let groups_before = groups(before);
        if !after.is_port_security_enabled() {
            self.index.deindex_interface(&groups_before, before);
            return;
        }
        let groups_after = groups(after);
        let (kept, removed): (Vec<AclId>, Vec<AclId>) = groups_before
            .into_iter()
            .partition(|acl| groups_after.contains(acl));
        self.index.deindex_interface(&removed, before);

        let prefixes_after: Vec<IpPrefix> = after.allowed_address_pairs().iter().map(|a| a.ip).collect();
        let removed_prefixes: Vec<IpPrefix> = before
            .allowed_address_pairs()
            .iter()
            .map(|a| a.ip)
            .filter(|ip| !prefixes_after.contains(ip))
            .collect();
        self.index
            .deindex_ip_prefixes(&kept, after.interface_id(), &removed_prefixes);
    }

    fn unbind_port(&self, interface_id: &str) -> Result<()> {
        let port = self
            .cache
            .get(interface_id)
            .ok_or_else(|| AclServiceError::port_not_found(interface_id))?;
        if port.is_marked_for_delete() {
            if let RemoveOutcome::Evicted(_) = self.cache.remove(interface_id) {
                debug!(port = interface_id, "port evicted");
            }
            return Ok(());
        }

        let mut delta = FlowDelta::new();
        if port.is_port_security_enabled() {
            for compiler in &self.compilers {
                match compiler.remove_acl(&port) {
                    Ok(removed) => delta.append(removed),
                    Err(e) if e.is_precondition() => {
                        debug!(port = interface_id, reason = %e, "nothing installed for port");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.index.deindex_interface(&groups(&port), &port);
        self.cache.remove(interface_id);
        self.submit(delta)
    }

    // ============ ACL events ============

    /// A new ACL: allocates its tag and programs its rules on any port
    /// already referencing it.
    pub fn on_acl_added(&self, acl: Acl) -> bool {
        let name = acl.name.clone();
        self.report("ACL added", &name, self.add_acl(acl))
    }

    /// Rules of an ACL changed. Unknown ACLs are treated as added.
    pub fn on_acl_updated(&self, acl: Acl) -> bool {
        let name = acl.name.clone();
        let result = match self.index.get_acl(&name) {
            Some(before) => self.update_acl(&before, acl),
            None => self.add_acl(acl),
        };
        self.report("ACL updated", &name, result)
    }

    pub fn on_acl_removed(&self, name: &str) -> bool {
        self.report("ACL removed", name, self.remove_acl(name))
    }

    fn add_acl(&self, acl: Acl) -> Result<()> {
        let name = acl.name.clone();
        let newly_tagged = self.index.get_tag(&name).is_none();
        let tag = self.tags.allocate(&self.config.tag_pool.name, &name)?;
        self.index.set_tag(&name, tag);
        info!(acl = %name, tag, rules = acl.rules.len(), "ACL added");

        let before = match self.index.get_acl(&name) {
            Some(existing) => Acl::clone(&existing),
            None => Acl::new(name.clone()),
        };
        self.update_acl(&before, acl)?;

        // Rules of other ACLs naming this one as remote group were
        // deferred until now.
        if newly_tagged {
            let mut delta = FlowDelta::new();
            for compiler in &self.compilers {
                delta.append(compiler.remote_group_tag_flows(&name, FlowOp::Add));
            }
            self.submit(delta)?;
        }
        Ok(())
    }

    fn update_acl(&self, before: &Acl, after: Acl) -> Result<()> {
        self.index.deindex_remote_acl(before);
        self.index.index_remote_acl(&after);
        self.index.put_acl(after.clone());

        let (removed, added) = rule_difference(before, &after);
        let members = self.index.interfaces(&after.name);
        let mut delta = FlowDelta::new();

        if !removed.is_empty() || !added.is_empty() {
            debug!(
                acl = %after.name,
                removed = removed.len(),
                added = added.len(),
                members = members.len(),
                "ACL rules changed"
            );
            for port in members
                .iter()
                .filter(|p| p.is_port_security_enabled() && !p.is_marked_for_delete())
            {
                if let Err(e) = self.check_bound(port) {
                    debug!(port = port.interface_id(), reason = %e, "skipping unbound member");
                    continue;
                }
                for compiler in &self.compilers {
                    for ace in &removed {
                        delta.append(compiler.remove_ace(port, &after.name, ace)?);
                    }
                    for ace in &added {
                        delta.append(compiler.apply_ace(port, &after.name, ace)?);
                    }
                }
            }
        }

        for compiler in &self.compilers {
            delta.append(compiler.update_remote_acl(before, &after, &members)?);
        }
        self.submit(delta)
    }

    /// Retires everything the ACL's tag is programmed into before the tag
    /// goes back to the pool: its rules on member ports, its remote group
    /// references and the rules of other ACLs naming it as remote group.
    fn remove_acl(&self, name: &str) -> Result<()> {
        let members = self.index.interfaces(name);
        if !members.is_empty() {
            warn!(acl = name, members = members.len(), "removing ACL still used by ports");
        }
        if let Some(acl) = self.index.get_acl(name) {
            self.update_acl(&acl, Acl::new(name))?;
            let mut delta = FlowDelta::new();
            for compiler in &self.compilers {
                delta.append(compiler.remote_group_tag_flows(name, FlowOp::Remove));
            }
            self.submit(delta)?;
        }

        if let Some(acl) = self.index.remove_acl(name) {
            self.index.deindex_remote_acl(&acl);
        }
        if let Some(tag) = self.index.clear_tag(name) {
            debug!(acl = name, tag, "releasing ACL tag");
        }
        self.tags.release(&self.config.tag_pool.name, name)
    }

    // ============ Plumbing ============

    fn check_bound(&self, port: &AclInterface) -> Result<()> {
        self.compilers
            .iter()
            .try_for_each(|compiler| compiler.check_bound(port))
    }

    fn submit(&self, delta: FlowDelta) -> Result<()> {
        for batch in delta {
            let added = batch.flows.iter().filter(|f| f.op == FlowOp::Add).count() as u64;
            let removed = batch.flows.len() as u64 - added;
            debug!(key = %batch.key, added, removed, "submitting flow batch");
            self.installer.submit(&batch.key, batch.flows)?;
            self.stats.batches_submitted.fetch_add(1, Ordering::Relaxed);
            self.stats.flows_added.fetch_add(added, Ordering::Relaxed);
            self.stats.flows_removed.fetch_add(removed, Ordering::Relaxed);
        }
        Ok(())
    }

    fn report(&self, operation: &str, subject: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) if e.is_precondition() => {
                warn!(operation, subject, reason = %e, "operation skipped");
                false
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                error!(operation, subject, error = %e, "operation failed");
                false
            }
        }
    }
}

fn groups(port: &AclInterface) -> Vec<AclId> {
    port.security_groups().map(<[AclId]>::to_vec).unwrap_or_default()
}

/// Rules to retire and rules to add, matched by name; a rule whose content
/// changed appears in both.
fn rule_difference<'a>(before: &'a Acl, after: &'a Acl) -> (Vec<&'a Ace>, Vec<&'a Ace>) {
    let removed = before
        .rules
        .iter()
        .filter(|ace| after.rule(&ace.rule_name) != Some(*ace))
        .collect();
    let added = after
        .rules
        .iter()
        .filter(|ace| before.rule(&ace.rule_name) != Some(*ace))
        .collect();
    (removed, added)
}
