//! Fixed per-port rules that do not come from ACEs.

use super::AclCompiler;
use crate::flow::{FlowEntry, FlowOp};
use crate::matches::{self, CtClassifier};
use crate::matches::{
    COMMITTER_PRIORITY, CT_INVALID_PRIORITY, CT_MARK_ALLOWED, CT_RECIRC_PRIORITY,
    CT_STATE_INVALID, CT_STATE_TRACKED, RULE_MISS_DROP_PRIORITY,
};
use crate::profile::PortContext;
use aclservice_types::IpVersion;

impl AclCompiler {
    /// Flows that depend on nothing but the port itself.
    pub(crate) fn port_scope_flows(&self, port: &PortContext<'_>, op: FlowOp) -> Vec<FlowEntry> {
        let tables = port.tables();
        let mut flows = self.profile.anti_spoof_port_flows(port, op);

        flows.push(
            port.port_flow(
                tables.ct_state,
                "CtState_Invalid_Drop",
                "",
                CT_INVALID_PRIORITY,
                op,
            )
            .extend_matches([matches::ct_state(
                CT_STATE_INVALID | CT_STATE_TRACKED,
                CT_STATE_INVALID | CT_STATE_TRACKED,
            )])
            .with_instructions(matches::drop_instructions()),
        );

        flows.push(
            port.port_flow(
                tables.filter,
                "RuleMiss_Drop",
                "",
                RULE_MISS_DROP_PRIORITY,
                op,
            )
            .with_instructions(matches::drop_instructions()),
        );

        flows.push(
            port.port_flow(
                tables.committer,
                "Committer_NonConntrack",
                "",
                COMMITTER_PRIORITY,
                op,
            )
            .with_matches(
                self.profile
                    .lport_classifier_matches(port.lport_tag, CtClassifier::NonConntrack),
            )
            .with_instructions(matches::next_table(tables.committer, tables.exit)),
        );

        flows
    }

    /// Conntrack recirculation and commit for one ether type present among
    /// the port's address pairs. Both carry the elan id as conntrack zone.
    pub(crate) fn ether_scope_flows(
        &self,
        port: &PortContext<'_>,
        version: IpVersion,
        op: FlowOp,
    ) -> Vec<FlowEntry> {
        let elan_id = port.elan_id;
        let tables = port.tables();
        let discriminator = version.to_string();

        let recirc = port
            .port_flow(
                tables.ct_classifier,
                "CtClassifier_Recirc",
                &discriminator,
                CT_RECIRC_PRIORITY,
                op,
            )
            .extend_matches([matches::eth_type(version), matches::ct_untracked()])
            .with_instructions(matches::ct_recirc(elan_id, tables.ct_state));

        let commit = port
            .port_flow(
                tables.committer,
                "Committer_Conntrack",
                &discriminator,
                COMMITTER_PRIORITY,
                op,
            )
            .with_matches(
                self.profile
                    .lport_classifier_matches(port.lport_tag, CtClassifier::Conntrack),
            )
            .extend_matches([matches::eth_type(version)])
            .with_instructions(matches::ct_commit_resubmit(
                elan_id,
                CT_MARK_ALLOWED,
                tables.exit,
            ));

        vec![recirc, commit]
    }
}
