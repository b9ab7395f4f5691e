//! Engine configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! # Optional sections
//! - `[connect]` -- `poll` (liveness ping as part of connect, default true)
//!   and `interface_events` (subscribe to interface state events on
//!   connect, default false).

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct OmConfig {
    pub schema_version: u32,
    pub connect: ConnectConfig,
}

#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Round-trip a control ping as the tail of `connect()`.
    pub poll: bool,
    /// Install the interface event subscription after connecting.
    pub interface_events: bool,
}

impl Default for OmConfig {
    fn default() -> Self {
        OmConfig {
            schema_version: 1,
            connect: ConnectConfig {
                poll: true,
                interface_events: false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    connect: Option<RawConnectConfig>,
}

#[derive(Debug, Deserialize)]
struct RawConnectConfig {
    poll: Option<bool>,
    interface_events: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load engine config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<OmConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load engine config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<OmConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let connect = match raw.connect {
        Some(c) => ConnectConfig {
            poll: c.poll.unwrap_or(true),
            interface_events: c.interface_events.unwrap_or(false),
        },
        None => ConnectConfig {
            poll: true,
            interface_events: false,
        },
    };

    Ok(OmConfig {
        schema_version,
        connect,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_applies_defaults() {
        let cfg = load_config_from_str("schema_version = 1").unwrap();
        assert!(cfg.connect.poll);
        assert!(!cfg.connect.interface_events);
    }

    #[test]
    fn full_config_overrides_defaults() {
        let cfg = load_config_from_str(
            r#"
            schema_version = 1

            [connect]
            poll = false
            interface_events = true
            "#,
        )
        .unwrap();
        assert!(!cfg.connect.poll);
        assert!(cfg.connect.interface_events);
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        let err = load_config_from_str("[connect]\npoll = true").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let err = load_config_from_str("schema_version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = load_config_from_str("schema_version = =").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
