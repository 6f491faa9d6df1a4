//! Remote ACL synchronization.
//!
//! A rule with a remote group admits traffic from (or to) every address of
//! the group's members. The dispatcher chain tags packets with the remote
//! ACL tag; the remote ACL table then holds one flow per (switch, tag,
//! member address), on every switch hosting a port whose ACLs reference
//! the group.
//!
//! Those flows are shared between ports and ACLs, so every delete first
//! recomputes who else still needs the flow from the current index:
//!
//! - per address: another port of the same ACL holding the same prefix
//!   keeps the flow
//! - per switch: another ACL still referencing the remote group from a
//!   port on that switch keeps the flow

use crate::compiler::{AceOp, AclCompiler};
use crate::error::Result;
use crate::flow::{FlowDelta, FlowEntry, FlowOp};
use crate::matches::{self, REMOTE_ACL_PRIORITY};
use aclservice_types::{Ace, Acl, AclId, AclInterface, AllowedAddressPair};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

impl AclCompiler {
    /// Membership flow: packets tagged `tag` whose remote address is `aap`
    /// go on to the committer.
    pub fn remote_acl_flow(&self, dp_id: u64, tag: u32, aap: &AllowedAddressPair, op: FlowOp) -> FlowEntry {
        let tables = self.profile().tables();
        FlowEntry::new(
            dp_id,
            tables.remote_acl,
            format!("{}_RemoteAcl_{}_{}_{}", self.direction(), dp_id, tag, aap.ip),
            REMOTE_ACL_PRIORITY,
        )
        .with_cookie(matches::cookie(tables.remote_acl))
        .with_matches(vec![matches::remote_acl_tag(tag)])
        .extend_matches(self.profile().remote_ip_matches(aap.ip))
        .with_instructions(matches::goto_table(tables.committer))
        .with_op(op)
    }

    /// Remote ACL table flows caused by `port` joining or leaving `acls`
    /// with the address pairs `aaps`, grouped by the ACL that owns them.
    ///
    /// - For each of `acls` referenced as a remote group: the port's own
    ///   addresses on every switch hosting a referencing port.
    /// - With `include_members`, for each remote group the `acls` reference:
    ///   the other members' addresses on the port's switch, emitted only by
    ///   the first referencing port on that switch. Groups the port keeps
    ///   referencing through its other ACLs are left alone.
    pub(crate) fn remote_acl_filter_flows(
        &self,
        port: &AclInterface,
        acls: &[AclId],
        aaps: &[AllowedAddressPair],
        op: FlowOp,
        include_members: bool,
    ) -> BTreeMap<AclId, Vec<FlowEntry>> {
        let direction = self.direction();
        let mut grouped: BTreeMap<AclId, Vec<FlowEntry>> = BTreeMap::new();

        for acl in acls {
            if self.index().get_remote_acl(acl, direction).is_none() {
                continue;
            }
            let Some(tag) = self.remote_tag(acl) else {
                continue;
            };
            let dpns = collect_dpns(&self.index().get_remote_acl_interfaces(acl, direction));
            for aap in aaps {
                if aap.ip.is_all_network() {
                    continue;
                }
                if op == FlowOp::Remove && self.skip_delete_for_overlapping_ip(port, acl, aap) {
                    debug!(
                        port = port.interface_id(),
                        acl = %acl,
                        ip = %aap.ip,
                        "address still held by another port, keeping remote flow"
                    );
                    continue;
                }
                let flows = grouped.entry(acl.clone()).or_default();
                for dp_id in &dpns {
                    flows.push(self.remote_acl_flow(*dp_id, tag, aap, op));
                }
            }
        }

        if include_members {
            let Some(dp_id) = port.dp_id() else {
                return grouped;
            };
            let other_groups: Vec<AclId> = port
                .security_groups()
                .unwrap_or_default()
                .iter()
                .filter(|acl| !acls.contains(acl))
                .cloned()
                .collect();
            let held = self.remote_acl_ids(&other_groups);
            for remote in self.remote_acl_ids(acls).difference(&held) {
                let members = self.index().interfaces(remote);
                if members.is_empty() || !self.is_first_port_in_dpn(port, dp_id, remote) {
                    continue;
                }
                let Some(tag) = self.remote_tag(remote) else {
                    continue;
                };
                let flows = grouped.entry(remote.clone()).or_default();
                for member in members
                    .iter()
                    .filter(|m| m.interface_id() != port.interface_id())
                {
                    for aap in member.allowed_address_pairs() {
                        if !aap.ip.is_all_network() {
                            flows.push(self.remote_acl_flow(dp_id, tag, aap, op));
                        }
                    }
                }
            }
        }

        grouped.retain(|_, flows| !flows.is_empty());
        grouped
    }

    /// Another port of `acl` still holds the exact prefix.
    fn skip_delete_for_overlapping_ip(
        &self,
        port: &AclInterface,
        acl: &str,
        aap: &AllowedAddressPair,
    ) -> bool {
        self.index()
            .ports_for_ip_prefix(acl, aap.ip)
            .iter()
            .any(|other| other != port.interface_id())
    }

    /// No other port referencing `remote` sits on `dp_id`.
    fn is_first_port_in_dpn(&self, port: &AclInterface, dp_id: u64, remote: &str) -> bool {
        !self
            .index()
            .get_remote_acl_interfaces(remote, self.direction())
            .values()
            .flatten()
            .any(|other| other.interface_id() != port.interface_id() && other.dp_id() == Some(dp_id))
    }

    /// Remote groups referenced in this direction by `acls`.
    fn remote_acl_ids(&self, acls: &[AclId]) -> BTreeSet<AclId> {
        let direction = self.direction();
        acls.iter()
            .filter_map(|name| self.index().get_acl(name))
            .flat_map(|acl| acl.remote_acl_ids(direction))
            .collect()
    }

    /// Propagates a change of the remote groups `before` references.
    ///
    /// `ports_before` are the ACL members at the time of the change; the
    /// index must already hold `after`. When the referenced set changed,
    /// every member's dispatcher chain is rebuilt. Remote ACL table flows
    /// are added for new references on every member switch and removed
    /// for dropped references on switches no other referencing ACL needs.
    pub fn update_remote_acl(
        &self,
        before: &Acl,
        after: &Acl,
        ports_before: &[AclInterface],
    ) -> Result<FlowDelta> {
        let mut delta = FlowDelta::new();
        let members = self.index().interfaces(&after.name);
        if members.is_empty() {
            return Ok(delta);
        }

        let direction = self.direction();
        let remote_before = before.remote_acl_ids(direction);
        let remote_after = after.remote_acl_ids(direction);
        let added: BTreeSet<AclId> = remote_after.difference(&remote_before).cloned().collect();
        let deleted: BTreeSet<AclId> = remote_before.difference(&remote_after).cloned().collect();

        let mut removals = Vec::new();
        let mut additions = Vec::new();

        if !added.is_empty() || !deleted.is_empty() {
            for port in ports_before.iter().filter(|p| p.is_port_security_enabled()) {
                match self.port_context(port) {
                    Ok(ctx) => {
                        removals.extend(self.dispatcher_flows(&ctx, port, Some(before), FlowOp::Remove))
                    }
                    Err(e) => debug!(port = port.interface_id(), error = %e, "skipping chain removal"),
                }
            }
            for port in members.iter().filter(|p| p.is_port_security_enabled()) {
                match self.port_context(port) {
                    Ok(ctx) => {
                        additions.extend(self.dispatcher_flows(&ctx, port, Some(after), FlowOp::Add))
                    }
                    Err(e) => debug!(port = port.interface_id(), error = %e, "skipping chain rebuild"),
                }
            }
        }

        let dpns: BTreeSet<u64> = members.iter().filter_map(AclInterface::dp_id).collect();
        removals.extend(self.remote_acl_table_flows(&after.name, &deleted, &dpns, FlowOp::Remove));
        additions.extend(self.remote_acl_table_flows(&after.name, &added, &dpns, FlowOp::Add));

        delta.push(after.name.clone(), removals);
        delta.push(after.name.clone(), additions);
        info!(
            acl = %after.name,
            direction = %direction,
            added = ?added,
            deleted = ?deleted,
            flows = delta.len(),
            "synchronized remote ACL references"
        );
        Ok(delta)
    }

    /// Flows that hang on `remote` having a tag, for ports of the other
    /// ACLs referencing it: their rules naming the group, their dispatcher
    /// chain and the group's member addresses on their switches.
    ///
    /// `Add` runs once the tag is allocated, `Remove` before it is
    /// released. A group referencing itself is covered by
    /// [`update_remote_acl`](Self::update_remote_acl) on its own members.
    pub fn remote_group_tag_flows(&self, remote: &str, op: FlowOp) -> FlowDelta {
        let mut delta = FlowDelta::new();
        let Some(tag) = self.remote_tag(remote) else {
            return delta;
        };
        let direction = self.direction();
        let mut referencing = self.index().get_remote_acl_interfaces(remote, direction);
        let own_members = referencing.remove(remote).unwrap_or_default();
        if referencing.is_empty() {
            return delta;
        }

        let ace_op = match op {
            FlowOp::Add => AceOp::Install,
            FlowOp::Remove => AceOp::Retire,
        };
        let mut rebuilt: BTreeSet<&str> = own_members.iter().map(AclInterface::interface_id).collect();

        for (acl_name, ports) in &referencing {
            let Some(acl) = self.index().get_acl(acl_name) else {
                continue;
            };
            let rules: Vec<&Ace> = acl
                .rules
                .iter()
                .filter(|ace| ace.remote_group().is_some_and(|group| group == remote))
                .collect();

            for port in ports
                .iter()
                .filter(|p| p.is_port_security_enabled() && !p.is_marked_for_delete())
            {
                let ctx = match self.port_context(port) {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        debug!(port = port.interface_id(), error = %e, "skipping referencing port");
                        continue;
                    }
                };
                let mut removals = Vec::new();
                let mut additions = Vec::new();
                if rebuilt.insert(port.interface_id()) {
                    let with_tag = self.remote_acl_tags(port, None);
                    let mut without_tag = with_tag.clone();
                    without_tag.remove(&tag);
                    let (old, new) = match op {
                        FlowOp::Add => (without_tag, with_tag),
                        FlowOp::Remove => (with_tag, without_tag),
                    };
                    removals.extend(self.chain_flows(&ctx, &old, FlowOp::Remove));
                    additions.extend(self.chain_flows(&ctx, &new, FlowOp::Add));
                }
                let rule_flows = rules
                    .iter()
                    .flat_map(|ace| self.ace_flows(&ctx, acl_name, ace, ace_op));
                match op {
                    FlowOp::Add => additions.extend(rule_flows),
                    FlowOp::Remove => removals.extend(rule_flows),
                }
                delta.push(port.interface_id(), removals);
                delta.push(port.interface_id(), additions);
            }
        }

        let covered: BTreeSet<u64> = own_members.iter().filter_map(AclInterface::dp_id).collect();
        let dpns: BTreeSet<u64> = collect_dpns(&referencing).difference(&covered).copied().collect();
        let aaps: BTreeSet<AllowedAddressPair> = self
            .index()
            .interfaces(remote)
            .iter()
            .flat_map(|member| member.allowed_address_pairs().iter().cloned())
            .filter(|aap| !aap.ip.is_all_network())
            .collect();
        let table_flows = dpns
            .iter()
            .flat_map(|dp_id| aaps.iter().map(move |aap| (*dp_id, aap)))
            .map(|(dp_id, aap)| self.remote_acl_flow(dp_id, tag, aap, op))
            .collect();
        delta.push(remote, table_flows);

        info!(
            remote,
            tag,
            direction = %direction,
            op = %op,
            flows = delta.len(),
            "remote group tag propagated"
        );
        delta
    }

    fn remote_acl_table_flows(
        &self,
        acl: &str,
        remotes: &BTreeSet<AclId>,
        dpns: &BTreeSet<u64>,
        op: FlowOp,
    ) -> Vec<FlowEntry> {
        let mut flows = Vec::new();
        for remote in remotes {
            let remote_members = self.index().interfaces(remote);
            if remote_members.is_empty() {
                continue;
            }
            let Some(tag) = self.remote_tag(remote) else {
                continue;
            };
            let aaps: BTreeSet<&AllowedAddressPair> = remote_members
                .iter()
                .flat_map(AclInterface::allowed_address_pairs)
                .filter(|aap| !aap.ip.is_all_network())
                .collect();

            let target_dpns: BTreeSet<u64> = match op {
                FlowOp::Add => dpns.clone(),
                FlowOp::Remove => {
                    let mut others = self.index().get_remote_acl_interfaces(remote, self.direction());
                    others.remove(acl);
                    let still_needed = collect_dpns(&others);
                    dpns.difference(&still_needed).copied().collect()
                }
            };

            for dp_id in &target_dpns {
                for aap in &aaps {
                    flows.push(self.remote_acl_flow(*dp_id, tag, aap, op));
                }
            }
        }
        flows
    }
}

fn collect_dpns(map: &BTreeMap<AclId, Vec<AclInterface>>) -> BTreeSet<u64> {
    map.values()
        .flatten()
        .filter_map(AclInterface::dp_id)
        .collect()
}
