//! Per-switch baseline flows.
//!
//! Installed once per direction when a switch attaches. They do not depend
//! on any ACL or port, so recomputing them yields the same set every time.

use crate::config::DefaultBehavior;
use crate::flow::FlowEntry;
use crate::matches::{self, *};
use crate::profile::DirectionProfile;
use aclservice_types::{IpAddress, IpPrefix};
use std::net::Ipv4Addr;

/// Builds the baseline flows of one direction.
#[derive(Debug, Clone, Copy)]
pub struct DefaultTableBuilder<'a> {
    profile: &'a dyn DirectionProfile,
    behavior: DefaultBehavior,
}

impl<'a> DefaultTableBuilder<'a> {
    pub fn new(profile: &'a dyn DirectionProfile, behavior: DefaultBehavior) -> Self {
        Self { profile, behavior }
    }

    fn flow(&self, dp_id: u64, table: u8, role: &str, priority: u16) -> FlowEntry {
        FlowEntry::new(
            dp_id,
            table,
            format!("{}_{}_{}", self.profile.direction(), role, dp_id),
            priority,
        )
        .with_cookie(matches::cookie(table))
    }

    /// Every baseline flow for `dp_id`.
    pub fn flows(&self, dp_id: u64) -> Vec<FlowEntry> {
        let mut flows = self.table_miss_flows(dp_id);
        flows.extend(self.conntrack_flows(dp_id));
        flows
    }

    /// One miss flow per ACL table.
    pub fn table_miss_flows(&self, dp_id: u64) -> Vec<FlowEntry> {
        let t = self.profile.tables();
        let filter_miss = match self.behavior {
            DefaultBehavior::Deny => drop_instructions(),
            DefaultBehavior::Allow => next_table(t.filter, t.committer),
        };

        [
            (t.anti_spoofer, drop_instructions()),
            (t.ct_classifier, next_table(t.ct_classifier, t.ct_state)),
            (t.ct_state, next_table(t.ct_state, t.existing_traffic)),
            (t.existing_traffic, next_table(t.existing_traffic, t.filter)),
            (t.filter, filter_miss),
            (t.rule_based_filter, next_table(t.rule_based_filter, t.filter)),
            (t.remote_acl, next_table(t.remote_acl, t.filter)),
            (t.committer, next_table(t.committer, t.exit)),
        ]
        .into_iter()
        .map(|(table, instructions)| {
            self.flow(dp_id, table, &format!("TableMiss_{}", table), TABLE_MISS_PRIORITY)
                .with_instructions(instructions)
        })
        .collect()
    }

    /// Static conntrack classification and broadcast bypass rules.
    pub fn conntrack_flows(&self, dp_id: u64) -> Vec<FlowEntry> {
        let t = self.profile.tables();
        let tracked = CT_STATE_TRACKED;
        let limited_broadcast = IpPrefix::host(IpAddress::V4(Ipv4Addr::BROADCAST));

        let established = |state: u32, role: &str| {
            self.flow(dp_id, t.existing_traffic, role, CT_EXISTING_PRIORITY)
                .with_matches(vec![
                    ct_state(state | tracked, state | tracked),
                    ct_mark(CT_MARK_ALLOWED),
                ])
                .with_instructions(next_table(t.existing_traffic, t.exit))
        };

        vec![
            // Packets tracked by an earlier pipeline start over untracked.
            self.flow(dp_id, t.ct_classifier, "CtClear", CT_CLEAR_PRIORITY)
                .with_matches(vec![ct_tracked()])
                .with_instructions(ct_clear_resubmit(t.ct_classifier)),
            self.flow(dp_id, t.ct_classifier, "Classifier_L2Broadcast", CLASSIFIER_BROADCAST_PRIORITY)
                .with_matches(vec![l2_broadcast_dst()])
                .with_instructions(next_table(t.ct_classifier, t.exit)),
            self.flow(dp_id, t.ct_classifier, "Classifier_Ipv4Broadcast", CLASSIFIER_BROADCAST_PRIORITY)
                .with_matches(matches::ip_prefix(limited_broadcast, false))
                .with_instructions(next_table(t.ct_classifier, t.exit)),
            self.flow(dp_id, t.ct_state, "CtState_Untracked", CT_UNTRACKED_PRIORITY)
                .with_matches(vec![ct_untracked()])
                .with_instructions(next_table(t.ct_state, t.exit)),
            established(CT_STATE_ESTABLISHED, "Existing_Established"),
            established(CT_STATE_RELATED, "Existing_Related"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ActionInfo, InstructionInfo, MatchInfo};
    use crate::profile::{EgressProfile, IngressProfile};
    use pretty_assertions::assert_eq;

    /// Whether `flows` holds a match-all miss entry for `table`.
    fn has_table_miss(flows: &[FlowEntry], table: u8) -> bool {
        flows
            .iter()
            .any(|f| f.table_id == table && f.priority == TABLE_MISS_PRIORITY && f.matches.is_empty())
    }

    #[test]
    fn test_every_acl_table_has_a_miss() {
        for profile in [&EgressProfile as &dyn DirectionProfile, &IngressProfile] {
            let flows = DefaultTableBuilder::new(profile, DefaultBehavior::Deny).flows(1);
            for table in profile.tables().acl_tables() {
                assert!(has_table_miss(&flows, table), "table {} has no miss", table);
            }
        }
    }

    #[test]
    fn test_backward_tables_resubmit() {
        let flows = DefaultTableBuilder::new(&EgressProfile, DefaultBehavior::Deny).table_miss_flows(1);
        let miss = |table: u8| flows.iter().find(|f| f.table_id == table).unwrap();

        assert_eq!(miss(212).goto_table(), Some(213));
        assert_eq!(miss(216).instructions, resubmit(215));
        assert_eq!(miss(217).instructions, resubmit(215));
        assert_eq!(miss(218).instructions, resubmit(17));
        assert!(miss(211).is_drop());
    }

    #[test]
    fn test_default_behavior_governs_filter_miss() {
        let deny = DefaultTableBuilder::new(&IngressProfile, DefaultBehavior::Deny).table_miss_flows(1);
        let allow = DefaultTableBuilder::new(&IngressProfile, DefaultBehavior::Allow).table_miss_flows(1);
        let filter = |flows: &[FlowEntry]| flows.iter().find(|f| f.table_id == 245).cloned().unwrap();

        assert!(filter(&deny).is_drop());
        assert_eq!(filter(&allow).goto_table(), Some(248));
        assert_eq!(filter(&allow).flow_id, "ingress_TableMiss_245_1");
    }

    #[test]
    fn test_established_requires_mark() {
        let flows = DefaultTableBuilder::new(&EgressProfile, DefaultBehavior::Deny).conntrack_flows(7);
        let established = flows
            .iter()
            .find(|f| f.flow_id == "egress_Existing_Established_7")
            .unwrap();
        assert!(established.has_match(&ct_mark(CT_MARK_ALLOWED)));
        assert_eq!(established.table_id, 214);

        let untracked = flows
            .iter()
            .find(|f| f.flow_id == "egress_CtState_Untracked_7")
            .unwrap();
        assert!(!untracked.matches.iter().any(|m| matches!(m, MatchInfo::CtMark { .. })));

        let clear = flows.iter().find(|f| f.flow_id == "egress_CtClear_7").unwrap();
        assert_eq!(
            clear.instructions,
            vec![InstructionInfo::ApplyActions(vec![
                ActionInfo::CtClear,
                ActionInfo::Resubmit { table: 212 },
            ])]
        );
    }

    #[test]
    fn test_rebuild_is_identical() {
        let builder = DefaultTableBuilder::new(&EgressProfile, DefaultBehavior::Deny);
        assert_eq!(builder.flows(3), builder.flows(3));
    }
}
