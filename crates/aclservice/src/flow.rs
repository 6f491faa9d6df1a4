//! Abstract flow entries produced by the compiler.
//!
//! A [`FlowEntry`] is a backend-neutral (switch, table, id, priority,
//! timeouts, cookie, matches, instructions, op) tuple. Matches and actions
//! are closed sum types; each backend encoder handles every variant (see
//! [`crate::ofctl`] for the text encoder).
//!
//! Flow ids are built deterministically from the direction, the table role,
//! the switch, the lport tag and rule discriminators, so compiling the same
//! logical rule twice yields the same id.

use aclservice_types::{IpPrefix, MacAddress};
use serde::Serialize;
use std::fmt;

/// Whether a flow is to be installed or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowOp {
    Add,
    Remove,
}

impl FlowOp {
    pub const fn inverse(&self) -> Self {
        match self {
            Self::Add => Self::Remove,
            Self::Remove => Self::Add,
        }
    }
}

impl fmt::Display for FlowOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// One match predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchInfo {
    EthType(u16),
    EthSrc(MacAddress),
    EthDst(MacAddress),
    IpProto(u8),
    /// Source address; the family picks `nw_src` or `ipv6_src`.
    IpSrc(IpPrefix),
    IpDst(IpPrefix),
    TcpSrc { port: u16, mask: u16 },
    TcpDst { port: u16, mask: u16 },
    UdpSrc { port: u16, mask: u16 },
    UdpDst { port: u16, mask: u16 },
    Icmpv4 { icmp_type: u8, code: Option<u8> },
    Icmpv6 { icmp_type: u8, code: Option<u8> },
    ArpSha(MacAddress),
    ArpSpa(IpPrefix),
    Metadata { value: u64, mask: u64 },
    Reg6 { value: u32, mask: u32 },
    CtState { state: u32, mask: u32 },
    CtMark { value: u32, mask: u32 },
}

/// One action inside an apply-actions instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionInfo {
    Drop,
    Resubmit {
        table: u8,
    },
    /// Send the packet through the connection tracker in `zone`; with
    /// `table`, the tracked packet continues in that table.
    Conntrack {
        commit: bool,
        zone: u64,
        table: Option<u8>,
        mark: Option<u32>,
    },
    CtClear,
}

/// One flow instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionInfo {
    GotoTable(u8),
    WriteMetadata { value: u64, mask: u64 },
    ApplyActions(Vec<ActionInfo>),
}

/// A single flow to install or remove on one switch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FlowEntry {
    pub dp_id: u64,
    pub table_id: u8,
    pub flow_id: String,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub cookie: u64,
    pub matches: Vec<MatchInfo>,
    pub instructions: Vec<InstructionInfo>,
    pub op: FlowOp,
}

impl FlowEntry {
    pub fn new(dp_id: u64, table_id: u8, flow_id: impl Into<String>, priority: u16) -> Self {
        Self {
            dp_id,
            table_id,
            flow_id: flow_id.into(),
            priority,
            idle_timeout: 0,
            hard_timeout: 0,
            cookie: 0,
            matches: Vec::new(),
            instructions: Vec::new(),
            op: FlowOp::Add,
        }
    }

    pub fn with_matches(mut self, matches: Vec<MatchInfo>) -> Self {
        self.matches = matches;
        self
    }

    pub fn extend_matches(mut self, matches: impl IntoIterator<Item = MatchInfo>) -> Self {
        self.matches.extend(matches);
        self
    }

    pub fn with_instructions(mut self, instructions: Vec<InstructionInfo>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_hard_timeout(mut self, seconds: u16) -> Self {
        self.hard_timeout = seconds;
        self
    }

    pub fn with_op(mut self, op: FlowOp) -> Self {
        self.op = op;
        self
    }

    /// Same flow with the opposite op.
    pub fn inverted(&self) -> Self {
        Self {
            op: self.op.inverse(),
            ..self.clone()
        }
    }

    /// True when the flow drops: an explicit drop action or no instructions.
    pub fn is_drop(&self) -> bool {
        self.instructions.is_empty()
            || self.instructions.iter().any(|i| {
                matches!(i, InstructionInfo::ApplyActions(actions)
                    if actions.iter().any(|a| matches!(a, ActionInfo::Drop)))
            })
    }

    pub fn goto_table(&self) -> Option<u8> {
        self.instructions.iter().find_map(|i| match i {
            InstructionInfo::GotoTable(t) => Some(*t),
            _ => None,
        })
    }

    pub fn has_match(&self, m: &MatchInfo) -> bool {
        self.matches.contains(m)
    }
}

/// Flows submitted together under one serialization key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlowBatch {
    pub key: String,
    pub flows: Vec<FlowEntry>,
}

/// Ordered list of batches produced by one compiler operation.
///
/// Batches are submitted in order; a delete batch placed before an add
/// batch is never merged into it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlowDelta {
    pub batches: Vec<FlowBatch>,
}

impl FlowDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a batch; empty flow lists are dropped.
    pub fn push(&mut self, key: impl Into<String>, flows: Vec<FlowEntry>) {
        if !flows.is_empty() {
            self.batches.push(FlowBatch {
                key: key.into(),
                flows,
            });
        }
    }

    pub fn append(&mut self, other: FlowDelta) {
        self.batches.extend(other.batches);
    }

    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|b| b.flows.is_empty())
    }

    pub fn len(&self) -> usize {
        self.batches.iter().map(|b| b.flows.len()).sum()
    }

    pub fn flows(&self) -> impl Iterator<Item = &FlowEntry> {
        self.batches.iter().flat_map(|b| b.flows.iter())
    }

    pub fn added(&self) -> impl Iterator<Item = &FlowEntry> {
        self.flows().filter(|f| f.op == FlowOp::Add)
    }

    pub fn removed(&self) -> impl Iterator<Item = &FlowEntry> {
        self.flows().filter(|f| f.op == FlowOp::Remove)
    }
}

impl IntoIterator for FlowDelta {
    type Item = FlowBatch;
    type IntoIter = std::vec::IntoIter<FlowBatch>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> FlowEntry {
        FlowEntry::new(1, 215, "Egress_Filter_1_10", 1005)
            .with_matches(vec![MatchInfo::EthType(0x0800)])
            .with_instructions(vec![InstructionInfo::GotoTable(218)])
    }

    #[test]
    fn test_inverted_flips_only_op() {
        let flow = sample();
        let inverted = flow.inverted();
        assert_eq!(inverted.op, FlowOp::Remove);
        assert_eq!(inverted.inverted(), flow);
        assert_eq!(inverted.matches, flow.matches);
    }

    #[test]
    fn test_is_drop() {
        assert!(!sample().is_drop());
        assert!(FlowEntry::new(1, 211, "x", 0).is_drop());
        let explicit = sample()
            .with_instructions(vec![InstructionInfo::ApplyActions(vec![ActionInfo::Drop])]);
        assert!(explicit.is_drop());
        assert_eq!(sample().goto_table(), Some(218));
    }

    #[test]
    fn test_delta_skips_empty_batches() {
        let mut delta = FlowDelta::new();
        delta.push("port-1", Vec::new());
        assert!(delta.is_empty());
        assert_eq!(delta.batches.len(), 0);

        delta.push("port-1", vec![sample()]);
        delta.push("sg1", vec![sample().inverted()]);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta.added().count(), 1);
        assert_eq!(delta.removed().count(), 1);
    }

    #[test]
    fn test_serialize_flow() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["table_id"], 215);
        assert_eq!(json["op"], "add");
        assert_eq!(json["matches"][0]["eth_type"], 2048);
    }
}
