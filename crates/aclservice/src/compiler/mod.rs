//! Flow compiler.
//!
//! One [`AclCompiler`] per direction. It turns a port's security groups,
//! address pairs and subnets into the flows of that direction's pipeline
//! and, on updates, into the minimal add/remove delta.
//!
//! Flows of one port are grouped by scope so updates can diff each scope
//! on its own key:
//!
//! - port: anti-spoofing basics, invalid drop, rule miss, non-conntrack
//!   committer
//! - address pair: goto-classifier and ARP sender rules
//! - MAC: DHCP client and L2 broadcast rules
//! - ether type: conntrack recirculation and commit
//! - subnet: broadcast and router advertisement rules
//! - ACE: one flow per rule (and port range block)
//! - dispatcher chain: remote ACL tag walk (see [`dispatcher`])
//! - remote ACL table: per-address membership flows (see [`crate::sync`])

mod ace;
mod dispatcher;
mod fixed;

use crate::config::TimeoutsConfig;
use crate::error::{AclServiceError, Result};
use crate::flow::{FlowDelta, FlowEntry, FlowOp};
use crate::index::AclDataIndex;
use crate::matches::{LPORT_TAG_MAX, REMOTE_ACL_TAG_MAX};
use crate::profile::{profile_for, DirectionProfile, PortContext};
use aclservice_types::{Ace, AclId, AclInterface, AllowedAddressPair, Direction, SubnetInfo};
use itertools::Itertools;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How an ACE is being (un)programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AceOp {
    /// Part of a full port install.
    Install,
    /// Part of a full port removal.
    Remove,
    /// Rule added to a live port: also clears a pending retire flow.
    Add,
    /// Rule removed from a live port: established sessions it admitted are
    /// re-marked and pushed back through the filter instead of being cut.
    Retire,
}

impl AceOp {
    pub const fn rule_op(&self) -> FlowOp {
        match self {
            Self::Install | Self::Add => FlowOp::Add,
            Self::Remove | Self::Retire => FlowOp::Remove,
        }
    }

    /// Op applied to the existing-traffic retire flow, if any.
    pub const fn retire_op(&self) -> Option<FlowOp> {
        match self {
            Self::Install | Self::Remove => None,
            Self::Add => Some(FlowOp::Remove),
            Self::Retire => Some(FlowOp::Add),
        }
    }

    pub const fn is_add(&self) -> bool {
        matches!(self.rule_op(), FlowOp::Add)
    }
}

/// Direction-parameterized ACL flow compiler.
#[derive(Debug)]
pub struct AclCompiler {
    profile: Box<dyn DirectionProfile>,
    index: Arc<AclDataIndex>,
    timeouts: TimeoutsConfig,
}

impl AclCompiler {
    pub fn new(direction: Direction, index: Arc<AclDataIndex>, timeouts: TimeoutsConfig) -> Self {
        Self::with_profile(profile_for(direction), index, timeouts)
    }

    pub fn with_profile(
        profile: Box<dyn DirectionProfile>,
        index: Arc<AclDataIndex>,
        timeouts: TimeoutsConfig,
    ) -> Self {
        Self {
            profile,
            index,
            timeouts,
        }
    }

    pub fn direction(&self) -> Direction {
        self.profile.direction()
    }

    pub fn profile(&self) -> &dyn DirectionProfile {
        self.profile.as_ref()
    }

    pub fn index(&self) -> &AclDataIndex {
        &self.index
    }

    /// Checks the port is bound: switch id, an in-range lport tag and an
    /// elan id present.
    pub fn check_bound(&self, port: &AclInterface) -> Result<()> {
        self.port_context(port).map(|_| ())
    }

    pub(crate) fn port_context<'a>(&'a self, port: &'a AclInterface) -> Result<PortContext<'a>> {
        let dp_id = port
            .dp_id()
            .ok_or_else(|| AclServiceError::missing_switch_id(port.interface_id(), self.direction()))?;
        let lport_tag = port
            .lport_tag()
            .ok_or_else(|| AclServiceError::missing_lport_tag(port.interface_id(), self.direction()))?;
        if lport_tag > LPORT_TAG_MAX {
            return Err(AclServiceError::LportTagOutOfRange {
                port: port.interface_id().to_string(),
                lport_tag,
            });
        }
        // Without a conntrack zone the port's IP traffic would bypass the
        // filter, so nothing is programmed until the elan resolves.
        let elan_id = port
            .elan_id()
            .ok_or_else(|| AclServiceError::missing_elan_id(port.interface_id(), self.direction()))?;
        Ok(PortContext {
            interface_id: port.interface_id(),
            dp_id,
            lport_tag,
            elan_id,
            profile: self.profile.as_ref(),
        })
    }

    /// Tag of `acl` as a remote group. Absent tags and tags wider than
    /// the metadata field both defer the caller's flows.
    pub(crate) fn remote_tag(&self, acl: &str) -> Option<u32> {
        match self.index.get_tag(acl) {
            Some(tag) if tag <= REMOTE_ACL_TAG_MAX => Some(tag),
            Some(tag) => {
                warn!(acl, tag, "remote ACL tag exceeds the metadata field");
                None
            }
            None => {
                debug!(acl, "remote ACL has no tag yet");
                None
            }
        }
    }

    fn check_secured<'a>(&self, port: &'a AclInterface) -> Result<&'a [AclId]> {
        if !port.is_port_security_enabled() {
            return Err(AclServiceError::PortSecurityDisabled {
                port: port.interface_id().to_string(),
            });
        }
        port.security_groups()
            .ok_or_else(|| AclServiceError::MissingSecurityGroups {
                port: port.interface_id().to_string(),
            })
    }

    // ============ Full install / removal ============

    /// Every flow of a newly secured port, as one batch keyed by the port.
    pub fn apply_acl(&self, port: &AclInterface) -> Result<FlowDelta> {
        let acls = self.check_secured(port)?;
        let ctx = self.port_context(port)?;

        let mut flows = self.port_flows(&ctx, port, FlowOp::Add);
        flows.extend(self.acls_ace_flows(&ctx, acls, AceOp::Install));
        flows.extend(self.dispatcher_flows(&ctx, port, None, FlowOp::Add));
        flows.extend(
            self.remote_acl_filter_flows(port, acls, port.allowed_address_pairs(), FlowOp::Add, true)
                .into_values()
                .flatten(),
        );

        let mut delta = FlowDelta::new();
        delta.push(port.interface_id(), flows);
        info!(
            port = port.interface_id(),
            direction = %self.direction(),
            flows = delta.len(),
            "compiled ACL install"
        );
        Ok(delta)
    }

    /// Mirror of [`apply_acl`](Self::apply_acl). Remote ACL table removals
    /// are keyed by the owning ACL since other ports share them.
    pub fn remove_acl(&self, port: &AclInterface) -> Result<FlowDelta> {
        let acls = self.check_secured(port)?;
        let ctx = self.port_context(port)?;

        let mut flows = self.port_flows(&ctx, port, FlowOp::Remove);
        flows.extend(self.acls_ace_flows(&ctx, acls, AceOp::Remove));
        flows.extend(self.dispatcher_flows(&ctx, port, None, FlowOp::Remove));

        let mut delta = FlowDelta::new();
        delta.push(port.interface_id(), flows);
        for (acl, flows) in self.remote_acl_filter_flows(
            port,
            acls,
            port.allowed_address_pairs(),
            FlowOp::Remove,
            true,
        ) {
            delta.push(acl, flows);
        }
        info!(
            port = port.interface_id(),
            direction = %self.direction(),
            flows = delta.len(),
            "compiled ACL removal"
        );
        Ok(delta)
    }

    // ============ Incremental update ============

    /// Minimal delta between two snapshots of the same port.
    ///
    /// A port security flip delegates to a full install or removal. The
    /// caller handles switch or lport changes as remove plus apply.
    pub fn update_acl(&self, before: &AclInterface, after: &AclInterface) -> Result<FlowDelta> {
        match (
            before.is_port_security_enabled(),
            after.is_port_security_enabled(),
        ) {
            (true, false) => return self.remove_acl(before),
            (false, true) => return self.apply_acl(after),
            (false, false) => return Ok(FlowDelta::new()),
            (true, true) => {}
        }

        let acls_before = self.check_secured(before)?;
        let acls_after = self.check_secured(after)?;
        let ctx_before = self.port_context(before)?;
        let ctx = self.port_context(after)?;

        let mut deletes = Vec::new();
        let mut adds = Vec::new();
        let mut delta = FlowDelta::new();

        // Address pairs, diffed per pair, per MAC and per ether type.
        let aap_keys = |port: &AclInterface| -> BTreeSet<_> {
            port.allowed_address_pairs().iter().map(AllowedAddressPair::key).collect()
        };
        let (keys_before, keys_after) = (aap_keys(before), aap_keys(after));
        let removed_aaps: Vec<AllowedAddressPair> = before
            .allowed_address_pairs()
            .iter()
            .filter(|aap| !keys_after.contains(&aap.key()))
            .cloned()
            .collect();
        let added_aaps: Vec<AllowedAddressPair> = after
            .allowed_address_pairs()
            .iter()
            .filter(|aap| !keys_before.contains(&aap.key()))
            .cloned()
            .collect();

        for aap in &removed_aaps {
            deletes.extend(self.profile.anti_spoof_aap_flows(&ctx_before, aap, FlowOp::Remove));
        }
        for aap in &added_aaps {
            adds.extend(self.profile.anti_spoof_aap_flows(&ctx, aap, FlowOp::Add));
        }

        let (macs_before, macs_after) = (before.macs(), after.macs());
        for mac in macs_before.difference(&macs_after) {
            deletes.extend(self.profile.anti_spoof_mac_flows(&ctx_before, *mac, FlowOp::Remove));
        }
        for mac in macs_after.difference(&macs_before) {
            adds.extend(self.profile.anti_spoof_mac_flows(&ctx, *mac, FlowOp::Add));
        }

        let (ethers_before, ethers_after) = (before.ether_types(), after.ether_types());
        for version in ethers_before.difference(&ethers_after) {
            deletes.extend(self.ether_scope_flows(&ctx_before, *version, FlowOp::Remove));
        }
        for version in ethers_after.difference(&ethers_before) {
            adds.extend(self.ether_scope_flows(&ctx, *version, FlowOp::Add));
        }

        // Only ACLs kept on the port; added and removed ones are handled
        // with the ACL diff below.
        let kept_acls: Vec<AclId> = acls_after
            .iter()
            .filter(|acl| acls_before.contains(acl))
            .cloned()
            .collect();
        let remote_aap_removals =
            self.remote_acl_filter_flows(before, &kept_acls, &removed_aaps, FlowOp::Remove, false);
        adds.extend(
            self.remote_acl_filter_flows(after, &kept_acls, &added_aaps, FlowOp::Add, false)
                .into_values()
                .flatten(),
        );

        // Subnets.
        for subnet in subnet_difference(before.subnets(), after.subnets()) {
            deletes.extend(self.profile.subnet_flows(&ctx_before, subnet, FlowOp::Remove));
        }
        for subnet in subnet_difference(after.subnets(), before.subnets()) {
            adds.extend(self.profile.subnet_flows(&ctx, subnet, FlowOp::Add));
        }

        // Security groups. The dispatcher chain is rebuilt as a whole since
        // the links between tags shift.
        let removed_acls: Vec<AclId> = acls_before
            .iter()
            .filter(|acl| !acls_after.contains(acl))
            .cloned()
            .collect();
        let added_acls: Vec<AclId> = acls_after
            .iter()
            .filter(|acl| !acls_before.contains(acl))
            .cloned()
            .collect();
        let mut remote_acl_removals = Vec::new();
        let mut acl_adds = Vec::new();
        if !removed_acls.is_empty() || !added_acls.is_empty() {
            debug!(
                port = after.interface_id(),
                removed = ?removed_acls,
                added = ?added_acls,
                "security groups changed"
            );
            deletes.extend(self.dispatcher_flows(&ctx_before, before, None, FlowOp::Remove));
            deletes.extend(self.acls_ace_flows(&ctx_before, &removed_acls, AceOp::Retire));
            remote_acl_removals.push(self.remote_acl_filter_flows(
                before,
                &removed_acls,
                before.allowed_address_pairs(),
                FlowOp::Remove,
                true,
            ));

            acl_adds.extend(self.dispatcher_flows(&ctx, after, None, FlowOp::Add));
            acl_adds.extend(self.acls_ace_flows(&ctx, &added_acls, AceOp::Add));
            acl_adds.extend(
                self.remote_acl_filter_flows(
                    after,
                    &added_acls,
                    after.allowed_address_pairs(),
                    FlowOp::Add,
                    true,
                )
                .into_values()
                .flatten(),
            );
        }

        // Deletes go out before adds, in their own batches.
        delta.push(after.interface_id(), deletes);
        for (acl, flows) in remote_aap_removals {
            delta.push(acl, flows);
        }
        for removals in remote_acl_removals {
            for (acl, flows) in removals {
                delta.push(acl, flows);
            }
        }
        adds.extend(acl_adds);
        delta.push(after.interface_id(), adds);

        info!(
            port = after.interface_id(),
            direction = %self.direction(),
            added = delta.added().count(),
            removed = delta.removed().count(),
            "compiled ACL update"
        );
        Ok(delta)
    }

    // ============ Single rules ============

    /// Installs one rule of `acl` on a live port.
    pub fn apply_ace(&self, port: &AclInterface, acl: &str, ace: &Ace) -> Result<FlowDelta> {
        self.single_ace(port, acl, ace, AceOp::Add)
    }

    /// Removes one rule of `acl` from a live port, retiring the sessions it
    /// admitted.
    pub fn remove_ace(&self, port: &AclInterface, acl: &str, ace: &Ace) -> Result<FlowDelta> {
        self.single_ace(port, acl, ace, AceOp::Retire)
    }

    fn single_ace(&self, port: &AclInterface, acl: &str, ace: &Ace, op: AceOp) -> Result<FlowDelta> {
        self.check_secured(port)?;
        let ctx = self.port_context(port)?;
        let mut delta = FlowDelta::new();
        delta.push(port.interface_id(), self.ace_flows(&ctx, acl, ace, op));
        Ok(delta)
    }

    // ============ Scope assembly ============

    /// All fixed (non-ACE) flows of the port.
    fn port_flows(&self, ctx: &PortContext<'_>, port: &AclInterface, op: FlowOp) -> Vec<FlowEntry> {
        let mut flows = self.port_scope_flows(ctx, op);
        for aap in port.allowed_address_pairs() {
            flows.extend(self.profile.anti_spoof_aap_flows(ctx, aap, op));
        }
        for mac in port.macs() {
            flows.extend(self.profile.anti_spoof_mac_flows(ctx, mac, op));
        }
        for version in port.ether_types() {
            flows.extend(self.ether_scope_flows(ctx, version, op));
        }
        for subnet in port.subnets() {
            flows.extend(self.profile.subnet_flows(ctx, subnet, op));
        }
        flows
    }

    /// ACE flows of every rule of the given ACLs.
    fn acls_ace_flows(&self, ctx: &PortContext<'_>, acls: &[AclId], op: AceOp) -> Vec<FlowEntry> {
        acls.iter()
            .unique()
            .flat_map(|acl_name| match self.index.get_acl(acl_name) {
                Some(acl) => acl
                    .rules
                    .iter()
                    .flat_map(|ace| self.ace_flows(ctx, acl_name, ace, op))
                    .collect::<Vec<_>>(),
                None => {
                    debug!(acl = %acl_name, port = ctx.interface_id, "ACL not indexed yet");
                    Vec::new()
                }
            })
            .collect()
    }
}

fn subnet_difference<'a>(from: &'a [SubnetInfo], other: &'a [SubnetInfo]) -> Vec<&'a SubnetInfo> {
    from.iter().filter(|s| !other.contains(s)).collect()
}

#[cfg(test)]
mod tests;
