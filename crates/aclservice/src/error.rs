//! Error types for the ACL service.
//!
//! Lookup misses (ACL not indexed yet, tag not allocated yet) are not
//! errors: the affected rule or chain link is left out of the current pass
//! and picked up by the next event. Only precondition failures, tag pool
//! exhaustion, installer failures and configuration problems surface here.

use aclservice_types::Direction;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ACL service operations.
pub type Result<T> = std::result::Result<T, AclServiceError>;

/// Errors raised by the compiler, the service facade and its collaborators.
#[derive(Debug, Error)]
pub enum AclServiceError {
    /// Port has not been bound to a switch yet.
    #[error("port '{port}' has no switch id ({direction})")]
    MissingSwitchId { port: String, direction: Direction },

    /// Port has no lport tag yet.
    #[error("port '{port}' has no lport tag ({direction})")]
    MissingLportTag { port: String, direction: Direction },

    /// Lport tag does not fit the port identity field.
    #[error("port '{port}' lport tag {lport_tag:#x} exceeds the port identity field")]
    LportTagOutOfRange { port: String, lport_tag: u32 },

    /// No elan resolved for the port, so it has no conntrack zone.
    #[error("port '{port}' has no elan id ({direction})")]
    MissingElanId { port: String, direction: Direction },

    /// Security groups were never populated for the port.
    #[error("port '{port}' has no security groups")]
    MissingSecurityGroups { port: String },

    /// Operation needs port security but it is off.
    #[error("port security is disabled on port '{port}'")]
    PortSecurityDisabled { port: String },

    /// Port is unknown to the interface cache.
    #[error("port '{port}' not found")]
    PortNotFound { port: String },

    /// The tag allocator could not hand out a tag.
    #[error("tag allocation failed in pool '{pool}' for '{name}': {message}")]
    TagAllocation {
        pool: String,
        name: String,
        message: String,
    },

    /// The flow installer rejected a batch.
    #[error("flow installer failed for batch '{batch_key}': {message}")]
    Installer { batch_key: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AclServiceError {
    pub fn missing_switch_id(port: impl Into<String>, direction: Direction) -> Self {
        Self::MissingSwitchId {
            port: port.into(),
            direction,
        }
    }

    pub fn missing_lport_tag(port: impl Into<String>, direction: Direction) -> Self {
        Self::MissingLportTag {
            port: port.into(),
            direction,
        }
    }

    pub fn missing_elan_id(port: impl Into<String>, direction: Direction) -> Self {
        Self::MissingElanId {
            port: port.into(),
            direction,
        }
    }

    pub fn port_not_found(port: impl Into<String>) -> Self {
        Self::PortNotFound { port: port.into() }
    }

    pub fn tag_allocation(
        pool: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TagAllocation {
            pool: pool.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn installer(batch_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Installer {
            batch_key: batch_key.into(),
            message: message.into(),
        }
    }

    /// Returns true for missing-state failures the caller should re-trigger
    /// once the state shows up (switch binding, elan, security groups).
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            AclServiceError::MissingSwitchId { .. }
                | AclServiceError::MissingLportTag { .. }
                | AclServiceError::LportTagOutOfRange { .. }
                | AclServiceError::MissingElanId { .. }
                | AclServiceError::MissingSecurityGroups { .. }
                | AclServiceError::PortSecurityDisabled { .. }
                | AclServiceError::PortNotFound { .. }
        )
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}
