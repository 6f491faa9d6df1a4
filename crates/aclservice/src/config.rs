//! Service configuration.
//!
//! Loaded from TOML; every field has a default so an empty file (or no
//! file at all) yields a working deny-by-default setup.

use crate::error::ConfigError;
use crate::matches::{ACE_DEFAULT_PRIORITY, REMOTE_ACL_TAG_MAX};
use aclservice_types::IpProtocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// What the filter table does with packets no rule permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultBehavior {
    #[default]
    Deny,
    Allow,
}

impl fmt::Display for DefaultBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deny => write!(f, "deny"),
            Self::Allow => write!(f, "allow"),
        }
    }
}

/// Conntrack idle timeouts in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_tcp_timeout")]
    pub tcp: u16,
    #[serde(default = "default_udp_timeout")]
    pub udp: u16,
    #[serde(default = "default_icmp_timeout")]
    pub icmp: u16,
    #[serde(default = "default_others_timeout")]
    pub others: u16,
}

impl TimeoutsConfig {
    /// Idle timeout for a rule protocol; rules without a protocol age out
    /// on the ICMP timeout.
    pub fn idle_timeout(&self, protocol: Option<IpProtocol>) -> u16 {
        match protocol {
            Some(IpProtocol::Tcp) => self.tcp,
            Some(IpProtocol::Udp) => self.udp,
            Some(IpProtocol::Icmp) | Some(IpProtocol::Icmpv6) | None => self.icmp,
            Some(IpProtocol::Other(_)) => self.others,
        }
    }
}

/// Numeric ACL tag pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPoolConfig {
    #[serde(default = "default_tag_pool_name")]
    pub name: String,
    #[serde(default = "default_tag_pool_min")]
    pub min: u32,
    #[serde(default = "default_tag_pool_max")]
    pub max: u32,
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclServiceConfig {
    #[serde(default)]
    pub default_behavior: DefaultBehavior,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub tag_pool: TagPoolConfig,
}

fn default_tcp_timeout() -> u16 {
    18000
}

fn default_udp_timeout() -> u16 {
    600
}

fn default_icmp_timeout() -> u16 {
    30
}

fn default_others_timeout() -> u16 {
    600
}

fn default_tag_pool_name() -> String {
    "aclservice.acl.tag".to_string()
}

fn default_tag_pool_min() -> u32 {
    1
}

fn default_tag_pool_max() -> u32 {
    30000
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            tcp: default_tcp_timeout(),
            udp: default_udp_timeout(),
            icmp: default_icmp_timeout(),
            others: default_others_timeout(),
        }
    }
}

impl Default for TagPoolConfig {
    fn default() -> Self {
        Self {
            name: default_tag_pool_name(),
            min: default_tag_pool_min(),
            max: default_tag_pool_max(),
        }
    }
}

impl AclServiceConfig {
    /// Loads and validates a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timeouts;
        for (field, value) in [
            ("timeouts.tcp", t.tcp),
            ("timeouts.udp", t.udp),
            ("timeouts.icmp", t.icmp),
            ("timeouts.others", t.others),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be > 0"));
            }
        }

        let pool = &self.tag_pool;
        if pool.name.is_empty() {
            return Err(ConfigError::invalid("tag_pool.name", "must not be empty"));
        }
        if pool.min == 0 {
            return Err(ConfigError::invalid("tag_pool.min", "must be > 0"));
        }
        if pool.min > pool.max {
            return Err(ConfigError::invalid(
                "tag_pool",
                format!("min ({}) > max ({})", pool.min, pool.max),
            ));
        }
        // Tags become part of flow priorities and of a 20-bit metadata field.
        if u32::from(ACE_DEFAULT_PRIORITY) + pool.max > u32::from(u16::MAX) {
            return Err(ConfigError::invalid(
                "tag_pool.max",
                format!("{} overflows the flow priority range", pool.max),
            ));
        }
        if pool.max > REMOTE_ACL_TAG_MAX {
            return Err(ConfigError::invalid(
                "tag_pool.max",
                format!("{} does not fit the remote ACL metadata field", pool.max),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AclServiceConfig::default();
        assert_eq!(config.default_behavior, DefaultBehavior::Deny);
        assert_eq!(config.timeouts.tcp, 18000);
        assert_eq!(config.timeouts.udp, 600);
        assert_eq!(config.timeouts.icmp, 30);
        assert_eq!(config.timeouts.others, 600);
        assert_eq!(config.tag_pool.name, "aclservice.acl.tag");
        assert_eq!(config.tag_pool.min, 1);
        assert_eq!(config.tag_pool.max, 30000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_idle_timeout_by_protocol() {
        let timeouts = TimeoutsConfig::default();
        assert_eq!(timeouts.idle_timeout(Some(IpProtocol::Tcp)), 18000);
        assert_eq!(timeouts.idle_timeout(Some(IpProtocol::Udp)), 600);
        assert_eq!(timeouts.idle_timeout(Some(IpProtocol::Icmpv6)), 30);
        assert_eq!(timeouts.idle_timeout(Some(IpProtocol::Other(47))), 600);
        assert_eq!(timeouts.idle_timeout(None), 30);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AclServiceConfig::from_toml_str(
            r#"
default_behavior = "allow"

[timeouts]
tcp = 3600
"#,
        )
        .unwrap();
        assert_eq!(config.default_behavior, DefaultBehavior::Allow);
        assert_eq!(config.timeouts.tcp, 3600);
        assert_eq!(config.timeouts.udp, 600);
        assert_eq!(config.tag_pool, TagPoolConfig::default());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = AclServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, AclServiceConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_pool() {
        let mut config = AclServiceConfig::default();
        config.tag_pool.min = 10;
        config.tag_pool.max = 5;
        assert!(config.validate().is_err());

        let mut config = AclServiceConfig::default();
        config.tag_pool.max = 65000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = AclServiceConfig::default();
        config.timeouts.udp = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "timeouts.udp"
        ));
    }

    #[test]
    fn test_unknown_behavior_fails_to_parse() {
        assert!(matches!(
            AclServiceConfig::from_toml_str("default_behavior = \"maybe\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tag_pool]\nmax = 500").unwrap();
        let config = AclServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tag_pool.max, 500);
        assert_eq!(config.tag_pool.min, 1);
    }

    #[test]
    fn test_from_missing_file() {
        assert!(matches!(
            AclServiceConfig::from_file("/nonexistent/aclservice.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
