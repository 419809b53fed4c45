//! Daemon configuration: TOML file + CLI overrides.

use portkeeper_core::{KeeperError, KeeperResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub forwarder: ForwarderSection,
    #[serde(default)]
    pub bootstrap: BootstrapSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            control_addr: default_control_addr(),
            state_file: default_state_file(),
        }
    }
}

/// `[forwarder]` section: which program runs the data plane and how long
/// spawn/stop calls may take.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderSection {
    #[serde(default = "default_program")]
    pub program: String,
    /// Argument template; `{listen_port}`, `{target_host}` and
    /// `{target_port}` are substituted per rule.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,
}

impl Default for ForwarderSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            startup_grace_ms: default_startup_grace_ms(),
            launch_timeout_secs: default_launch_timeout(),
            terminate_timeout_secs: default_terminate_timeout(),
        }
    }
}

/// `[bootstrap]` section: the account created on first start.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapSection {
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
    #[serde(default = "default_admin_password")]
    pub admin_password: String,
}

impl Default for BootstrapSection {
    fn default() -> Self {
        Self {
            admin_user: default_admin_user(),
            admin_password: default_admin_password(),
        }
    }
}

fn default_control_addr() -> String {
    "127.0.0.1:4780".to_string()
}
fn default_state_file() -> String {
    "~/.portkeeper/portkeeper.db".to_string()
}
fn default_program() -> String {
    "socat".to_string()
}
fn default_args() -> Vec<String> {
    vec![
        "TCP-LISTEN:{listen_port},fork,reuseaddr".to_string(),
        "TCP:{target_host}:{target_port}".to_string(),
    ]
}
fn default_startup_grace_ms() -> u64 {
    250
}
fn default_launch_timeout() -> u64 {
    10
}
fn default_terminate_timeout() -> u64 {
    10
}
fn default_admin_user() -> String {
    "admin".to_string()
}
fn default_admin_password() -> String {
    "admin".to_string()
}

/// Values given on the command line (or via environment) that win over the
/// config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub control_addr: Option<String>,
    pub state_file: Option<String>,
    pub program: Option<String>,
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
}

/// Forwarder launch/stop settings.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub program: String,
    pub args: Vec<String>,
    pub startup_grace: Duration,
    pub launch_timeout: Duration,
    pub terminate_timeout: Duration,
}

/// Resolved daemon configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub control_addr: SocketAddr,
    pub state_file: PathBuf,
    pub forwarder: ForwarderConfig,
    pub admin_user: String,
    pub admin_password: String,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> KeeperResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed config file with overrides and validate the result.
    pub fn resolve(file_config: ConfigFile, overrides: ConfigOverrides) -> KeeperResult<Self> {
        let ConfigFile {
            server,
            forwarder,
            bootstrap,
        } = file_config;

        let addr_str = overrides.control_addr.unwrap_or(server.control_addr);
        let control_addr: SocketAddr = addr_str.parse().map_err(|e| {
            KeeperError::Other(format!("invalid control address '{addr_str}': {e}"))
        })?;

        let state_file = overrides.state_file.unwrap_or(server.state_file);
        let program = overrides.program.unwrap_or(forwarder.program);
        if program.trim().is_empty() {
            return Err(KeeperError::Other("forwarder program must not be empty".into()));
        }

        let admin_user = overrides.admin_user.unwrap_or(bootstrap.admin_user);
        if admin_user.trim().is_empty() {
            return Err(KeeperError::Other("bootstrap admin user must not be empty".into()));
        }

        Ok(Self {
            control_addr,
            state_file: expand_tilde_str(&state_file),
            forwarder: ForwarderConfig {
                program,
                args: forwarder.args,
                startup_grace: Duration::from_millis(forwarder.startup_grace_ms),
                launch_timeout: Duration::from_secs(forwarder.launch_timeout_secs.max(1)),
                terminate_timeout: Duration::from_secs(forwarder.terminate_timeout_secs.max(1)),
            },
            admin_user,
            admin_password: overrides.admin_password.unwrap_or(bootstrap.admin_password),
        })
    }
}

fn parse_config(content: &str) -> KeeperResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| KeeperError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_empty() {
        let cfg = ServerConfig::resolve(parse_config("").unwrap(), ConfigOverrides::default())
            .unwrap();
        assert_eq!(cfg.control_addr, "127.0.0.1:4780".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.forwarder.program, "socat");
        assert_eq!(cfg.forwarder.args.len(), 2);
        assert_eq!(cfg.forwarder.startup_grace, Duration::from_millis(250));
        assert_eq!(cfg.forwarder.launch_timeout, Duration::from_secs(10));
        assert_eq!(cfg.admin_user, "admin");
        assert!(cfg.state_file.ends_with(".portkeeper/portkeeper.db"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let toml_str = r#"
[server]
control_addr = "127.0.0.1:9000"

[forwarder]
program = "/usr/local/bin/socat"
startup_grace_ms = 0
"#;
        let cfg = ServerConfig::resolve(parse_config(toml_str).unwrap(), ConfigOverrides::default())
            .unwrap();
        assert_eq!(cfg.control_addr.port(), 9000);
        assert_eq!(cfg.forwarder.program, "/usr/local/bin/socat");
        assert_eq!(cfg.forwarder.startup_grace, Duration::ZERO);
        assert_eq!(cfg.forwarder.terminate_timeout, Duration::from_secs(10));
        assert_eq!(cfg.admin_password, "admin");
    }

    #[test]
    fn overrides_win() {
        let toml_str = r#"
[server]
state_file = "/var/lib/portkeeper/portkeeper.db"

[bootstrap]
admin_user = "root"
"#;
        let overrides = ConfigOverrides {
            state_file: Some("/tmp/pk.db".into()),
            admin_user: Some("operator".into()),
            admin_password: Some("changeme".into()),
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(parse_config(toml_str).unwrap(), overrides).unwrap();
        assert_eq!(cfg.state_file, PathBuf::from("/tmp/pk.db"));
        assert_eq!(cfg.admin_user, "operator");
        assert_eq!(cfg.admin_password, "changeme");
    }

    #[test]
    fn invalid_control_addr_rejected() {
        let overrides = ConfigOverrides {
            control_addr: Some("localhost".into()),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), overrides).is_err());
    }

    #[test]
    fn malformed_toml_rejected() {
        assert!(parse_config("[server\ncontrol_addr = 1").is_err());
    }

    #[test]
    fn zero_timeouts_are_clamped() {
        let toml_str = r#"
[forwarder]
launch_timeout_secs = 0
terminate_timeout_secs = 0
"#;
        let cfg = ServerConfig::resolve(parse_config(toml_str).unwrap(), ConfigOverrides::default())
            .unwrap();
        assert_eq!(cfg.forwarder.launch_timeout, Duration::from_secs(1));
        assert_eq!(cfg.forwarder.terminate_timeout, Duration::from_secs(1));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(
            Some(&dir.path().join("absent.toml")),
            ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.forwarder.program, "socat");
    }
}
