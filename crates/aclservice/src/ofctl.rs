//! `ovs-ofctl` style text rendering of flows.
//!
//! Used by the `aclcompile` binary and in debug logs. The part after the
//! flow id follows `ovs-ofctl add-flow` syntax.

use crate::flow::{ActionInfo, FlowEntry, FlowOp, InstructionInfo, MatchInfo};
use crate::matches::{
    CT_STATE_ESTABLISHED, CT_STATE_INVALID, CT_STATE_NEW, CT_STATE_RELATED, CT_STATE_REPLY,
    CT_STATE_TRACKED,
};
use aclservice_types::IpVersion;
use std::fmt;

const CT_STATE_FLAGS: [(u32, &str); 6] = [
    (CT_STATE_NEW, "new"),
    (CT_STATE_ESTABLISHED, "est"),
    (CT_STATE_RELATED, "rel"),
    (CT_STATE_REPLY, "rpl"),
    (CT_STATE_INVALID, "inv"),
    (CT_STATE_TRACKED, "trk"),
];

fn write_l4_port(f: &mut fmt::Formatter<'_>, field: &str, port: u16, mask: u16) -> fmt::Result {
    if mask == u16::MAX {
        write!(f, "{}={}", field, port)
    } else {
        write!(f, "{}={}/{:#06x}", field, port, mask)
    }
}

impl fmt::Display for MatchInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EthType(t) => write!(f, "dl_type={:#06x}", t),
            Self::EthSrc(mac) => write!(f, "dl_src={}", mac),
            Self::EthDst(mac) => write!(f, "dl_dst={}", mac),
            Self::IpProto(p) => write!(f, "nw_proto={}", p),
            Self::IpSrc(prefix) => match prefix.version() {
                IpVersion::V4 => write!(f, "nw_src={}", prefix),
                IpVersion::V6 => write!(f, "ipv6_src={}", prefix),
            },
            Self::IpDst(prefix) => match prefix.version() {
                IpVersion::V4 => write!(f, "nw_dst={}", prefix),
                IpVersion::V6 => write!(f, "ipv6_dst={}", prefix),
            },
            Self::TcpSrc { port, mask } => write_l4_port(f, "tcp_src", *port, *mask),
            Self::TcpDst { port, mask } => write_l4_port(f, "tcp_dst", *port, *mask),
            Self::UdpSrc { port, mask } => write_l4_port(f, "udp_src", *port, *mask),
            Self::UdpDst { port, mask } => write_l4_port(f, "udp_dst", *port, *mask),
            Self::Icmpv4 { icmp_type, code } => {
                write!(f, "icmp_type={}", icmp_type)?;
                match code {
                    Some(code) => write!(f, ",icmp_code={}", code),
                    None => Ok(()),
                }
            }
            Self::Icmpv6 { icmp_type, code } => {
                write!(f, "icmpv6_type={}", icmp_type)?;
                match code {
                    Some(code) => write!(f, ",icmpv6_code={}", code),
                    None => Ok(()),
                }
            }
            Self::ArpSha(mac) => write!(f, "arp_sha={}", mac),
            Self::ArpSpa(prefix) => write!(f, "arp_spa={}", prefix),
            Self::Metadata { value, mask } => write!(f, "metadata={:#x}/{:#x}", value, mask),
            Self::Reg6 { value, mask } => write!(f, "reg6={:#x}/{:#x}", value, mask),
            Self::CtState { state, mask } => {
                f.write_str("ct_state=")?;
                for (bit, name) in CT_STATE_FLAGS {
                    if mask & bit != 0 {
                        let sign = if state & bit != 0 { '+' } else { '-' };
                        write!(f, "{}{}", sign, name)?;
                    }
                }
                Ok(())
            }
            Self::CtMark { value, mask } => {
                if *mask == u32::MAX {
                    write!(f, "ct_mark={:#x}", value)
                } else {
                    write!(f, "ct_mark={:#x}/{:#x}", value, mask)
                }
            }
        }
    }
}

impl fmt::Display for ActionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => f.write_str("drop"),
            Self::Resubmit { table } => write!(f, "resubmit(,{})", table),
            Self::Conntrack {
                commit,
                zone,
                table,
                mark,
            } => {
                f.write_str("ct(")?;
                if *commit {
                    f.write_str("commit,")?;
                }
                write!(f, "zone={}", zone)?;
                if let Some(table) = table {
                    write!(f, ",table={}", table)?;
                }
                if let Some(mark) = mark {
                    write!(f, ",exec(set_field:{:#x}->ct_mark)", mark)?;
                }
                f.write_str(")")
            }
            Self::CtClear => f.write_str("ct_clear"),
        }
    }
}

impl fmt::Display for InstructionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GotoTable(table) => write!(f, "goto_table:{}", table),
            Self::WriteMetadata { value, mask } => {
                write!(f, "write_metadata:{:#x}/{:#x}", value, mask)
            }
            Self::ApplyActions(actions) => {
                for (i, action) in actions.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", action)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table={}, priority={}, cookie={:#x}",
            self.table_id, self.priority, self.cookie
        )?;
        if self.idle_timeout > 0 {
            write!(f, ", idle_timeout={}", self.idle_timeout)?;
        }
        if self.hard_timeout > 0 {
            write!(f, ", hard_timeout={}", self.hard_timeout)?;
        }
        for m in &self.matches {
            write!(f, ",{}", m)?;
        }
        f.write_str(" actions=")?;
        if self.instructions.is_empty() {
            return f.write_str("drop");
        }
        for (i, instruction) in self.instructions.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", instruction)?;
        }
        Ok(())
    }
}

/// One line per flow: `<op> dp=<dp> id=<flow id> <flow>`.
pub fn render_line(flow: &FlowEntry) -> String {
    let verb = match flow.op {
        FlowOp::Add => "add-flow",
        FlowOp::Remove => "del-flows",
    };
    format!("{} dp={} id={} {}", verb, flow.dp_id, flow.flow_id, flow)
}
