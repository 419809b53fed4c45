//! Client configuration at `~/.portkeeper/config.toml`.
//!
//! Provides the default daemon address and username.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Control address of `portkeeperd`.
    #[serde(default = "default_addr")]
    pub addr: String,

    #[serde(default = "default_username")]
    pub username: String,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            username: default_username(),
        }
    }
}

fn default_addr() -> String {
    "127.0.0.1:4780".to_string()
}

fn default_username() -> String {
    "admin".to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// Split a `host:port` target into its parts. IPv6 hosts must be bracketed
/// (`[::1]:22`); the brackets are stripped.
pub fn parse_target(target: &str) -> Result<(String, String)> {
    let target = target.trim();
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .with_context(|| format!("unterminated '[' in target '{target}'"))?;
        let port = after
            .strip_prefix(':')
            .with_context(|| format!("missing port in target '{target}'"))?;
        (host, port)
    } else {
        target
            .rsplit_once(':')
            .with_context(|| format!("target '{target}' must be host:port"))?
    };

    if host.is_empty() {
        anyhow::bail!("empty host in target '{target}'");
    }
    if host.contains(':') && !target.starts_with('[') {
        anyhow::bail!("IPv6 target '{target}' must be written as [addr]:port");
    }
    Ok((host.to_string(), port.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_and_port() {
        let (host, port) = parse_target("db.internal:5432").unwrap();
        assert_eq!(host, "db.internal");
        assert_eq!(port, "5432");
    }

    #[test]
    fn parse_bracketed_ipv6() {
        let (host, port) = parse_target("[fe80::1]:22").unwrap();
        assert_eq!(host, "fe80::1");
        assert_eq!(port, "22");
    }

    #[test]
    fn parse_rejects_malformed_targets() {
        assert!(parse_target("no-port").is_err());
        assert!(parse_target(":80").is_err());
        assert!(parse_target("::1:80").is_err());
        assert!(parse_target("[::1]80").is_err());
        assert!(parse_target("[::1:80").is_err());
    }

    #[test]
    fn port_text_is_passed_through_unvalidated() {
        // Numeric validation happens on the rule parameters, not here.
        let (_, port) = parse_target("host:abc").unwrap();
        assert_eq!(port, "abc");
    }

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.default.addr, "127.0.0.1:4780");
        assert_eq!(cfg.default.username, "admin");
    }

    #[test]
    fn parse_partial_toml_config() {
        let toml_str = r#"
[default]
username = "ops"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.default.username, "ops");
        assert_eq!(cfg.default.addr, "127.0.0.1:4780");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.default.username, "admin");
    }
}
