//! ACL flow compiler.
//!
//! Turns security groups (ACLs), their rules and the ports bound to them
//! into the flows of a per-direction conntrack pipeline, and keeps those
//! flows in step with port and ACL changes.
//!
//! # Architecture
//!
//! ```text
//! port / ACL / switch events
//!            |
//!            v
//!      [AclService] --> [AclInterfaceCache]
//!            |      \-> [AclDataIndex] <--------------\
//!            v                                        |
//!   [AclCompiler x {ingress, egress}] -- DirectionProfile
//!            |
//!            v
//!       FlowDelta --> FlowInstaller (per serialization key)
//! ```
//!
//! # Key Components
//!
//! - [`index::AclDataIndex`]: ACL definitions, memberships, remote group
//!   references and tags
//! - [`cache::AclInterfaceCache`]: latest port snapshot with optimistic
//!   updates and two-phase removal
//! - [`compiler::AclCompiler`]: full install, removal and minimal diffs
//! - [`sync`]: cross-switch remote ACL propagation
//! - [`default_tables`]: per-switch table-miss and conntrack baseline
//! - [`service::AclService`]: event entry points

pub mod cache;
pub mod compiler;
pub mod config;
pub mod default_tables;
pub mod error;
pub mod flow;
pub mod index;
pub mod installer;
pub mod matches;
pub mod ofctl;
pub mod profile;
pub mod service;
pub mod sync;

pub use cache::{AclInterfaceCache, RemoveOutcome};
pub use compiler::{AceOp, AclCompiler};
pub use config::{AclServiceConfig, DefaultBehavior, TagPoolConfig, TimeoutsConfig};
pub use default_tables::DefaultTableBuilder;
pub use error::{AclServiceError, ConfigError, Result};
pub use flow::{ActionInfo, FlowBatch, FlowDelta, FlowEntry, FlowOp, InstructionInfo, MatchInfo};
pub use index::AclDataIndex;
pub use installer::{ElanResolver, FlowInstaller, LocalTagPool, TagAllocator};
pub use profile::{DirectionProfile, EgressProfile, IngressProfile, PipelineTables};
pub use service::{AclService, AclServiceStats};
