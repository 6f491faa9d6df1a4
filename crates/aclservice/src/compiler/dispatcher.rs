//! Remote ACL dispatcher chain.
//!
//! The filter table walks a port's remote ACL tags in ascending order:
//!
//! ```text
//! first  (port)            -> write tag[0], goto rule based filter
//! next   (port, tag[i-1])  -> write tag[i], goto rule based filter
//! last   (port, tag[n-1])  -> drop
//! ```
//!
//! A packet no rule of the current tag admits falls back from the rule
//! based filter to the filter table, where the next link picks it up.
//!
//! n tags take n + 1 entries. The link matching `tag[n-1]` would have
//! nowhere to advance to, and a single entry cannot both write a new tag
//! for the first pass and drop on the return pass, since on return the
//! packet already carries `tag[n-1]`. So the advancing entries key on the
//! previous tag and a separate terminal entry keys on the last one.

use super::AclCompiler;
use crate::flow::{FlowEntry, FlowOp, InstructionInfo};
use crate::matches::{
    self, DISPATCHER_FIRST_PRIORITY, DISPATCHER_LAST_PRIORITY, DISPATCHER_NEXT_PRIORITY,
};
use crate::profile::PortContext;
use aclservice_types::{Acl, AclInterface};
use std::collections::BTreeSet;

impl AclCompiler {
    /// Tags of the remote groups referenced, in this direction, by the
    /// port's ACLs. `overriding` replaces the indexed definition of the ACL
    /// with the same name.
    pub fn remote_acl_tags(&self, port: &AclInterface, overriding: Option<&Acl>) -> BTreeSet<u32> {
        let direction = self.direction();
        let mut tags = BTreeSet::new();

        for acl_name in port.security_groups().unwrap_or_default() {
            let remote_ids = match overriding.filter(|acl| acl.name == *acl_name) {
                Some(acl) => acl.remote_acl_ids(direction),
                None => match self.index.get_acl(acl_name) {
                    Some(acl) => acl.remote_acl_ids(direction),
                    None => continue,
                },
            };
            tags.extend(remote_ids.iter().filter_map(|remote| self.remote_tag(remote)));
        }
        tags
    }

    /// The whole chain for the port; empty when it references no tagged
    /// remote group.
    pub(crate) fn dispatcher_flows(
        &self,
        ctx: &PortContext<'_>,
        port: &AclInterface,
        overriding: Option<&Acl>,
        op: FlowOp,
    ) -> Vec<FlowEntry> {
        self.chain_flows(ctx, &self.remote_acl_tags(port, overriding), op)
    }

    pub(crate) fn chain_flows(
        &self,
        ctx: &PortContext<'_>,
        tags: &BTreeSet<u32>,
        op: FlowOp,
    ) -> Vec<FlowEntry> {
        let tables = ctx.tables();
        let mut flows = Vec::with_capacity(tags.len() + 1);
        let mut previous: Option<u32> = None;

        for &tag in tags {
            let link = match previous {
                None => ctx.port_flow(
                    tables.filter,
                    "Dispatcher_First",
                    &tag.to_string(),
                    DISPATCHER_FIRST_PRIORITY,
                    op,
                ),
                Some(prev) => ctx
                    .port_flow(
                        tables.filter,
                        "Dispatcher_Next",
                        &tag.to_string(),
                        DISPATCHER_NEXT_PRIORITY,
                        op,
                    )
                    .with_matches(self.profile.lport_remote_tag_matches(ctx.lport_tag, prev)),
            };
            flows.push(link.with_instructions(vec![
                matches::write_remote_acl_tag(tag),
                InstructionInfo::GotoTable(tables.rule_based_filter),
            ]));
            previous = Some(tag);
        }

        if let Some(last) = previous {
            flows.push(
                ctx.port_flow(
                    tables.filter,
                    "Dispatcher_Last",
                    &last.to_string(),
                    DISPATCHER_LAST_PRIORITY,
                    op,
                )
                .with_matches(self.profile.lport_remote_tag_matches(ctx.lport_tag, last))
                .with_instructions(matches::drop_instructions()),
            );
        }

        flows
    }
}
