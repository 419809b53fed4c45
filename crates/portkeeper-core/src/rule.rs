//! Forwarding rule model.
//!
//! A [`ForwardingRule`] is the persisted unit of work: a listen port mapped
//! to a target `host:port`, owned by one account, plus the pid of the
//! forwarder last started for it. That pid is a [`LastKnownPid`]: a
//! back-reference into the host process table that may have gone stale, and
//! is never treated as proof that a forwarder is running.

use crate::error::{KeeperError, KeeperResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;

/// Longest hostname accepted as a forward target.
const MAX_HOST_LEN: usize = 253;

/// Store-assigned identifier of a forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned identifier of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pid recorded for the forwarder most recently started for a rule.
///
/// The process may have exited, and after a restart the number may even
/// belong to an unrelated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LastKnownPid(pub u32);

impl LastKnownPid {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LastKnownPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw, unvalidated rule parameters as submitted by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleParams {
    pub listen_port: String,
    pub target_host: String,
    pub target_port: String,
}

impl RuleParams {
    pub fn new(
        listen_port: impl Into<String>,
        target_host: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            listen_port: listen_port.into(),
            target_host: target_host.into(),
            target_port: target_port.into(),
        }
    }
}

/// A validated `(listen port, target host, target port)` tuple.
///
/// Only constructible through [`ForwardSpec::new`] or [`ForwardSpec::parse`],
/// so holding one means the values are well formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardSpec {
    listen_port: u16,
    target_host: String,
    target_port: u16,
}

impl ForwardSpec {
    /// Build a spec from typed values.
    pub fn new(listen_port: u16, target_host: &str, target_port: u16) -> KeeperResult<Self> {
        if listen_port == 0 {
            return Err(KeeperError::InvalidParameters(
                "listen port must be between 1 and 65535".into(),
            ));
        }
        if target_port == 0 {
            return Err(KeeperError::InvalidParameters(
                "target port must be between 1 and 65535".into(),
            ));
        }
        let target_host = validate_host(target_host)?;
        Ok(Self {
            listen_port,
            target_host,
            target_port,
        })
    }

    /// Parse operator-supplied strings.
    pub fn parse(params: &RuleParams) -> KeeperResult<Self> {
        let listen_port = parse_port("listen port", &params.listen_port)?;
        let target_port = parse_port("target port", &params.target_port)?;
        Self::new(listen_port, &params.target_host, target_port)
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Target host in a form usable inside a `host:port` address
    /// (IPv6 literals are bracketed).
    pub fn target_host_for_address(&self) -> String {
        if self.target_host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]", self.target_host)
        } else {
            self.target_host.clone()
        }
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ":{} -> {}:{}",
            self.listen_port,
            self.target_host_for_address(),
            self.target_port
        )
    }
}

/// A persisted forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub id: RuleId,
    pub spec: ForwardSpec,
    pub owner: UserId,
    pub last_known_pid: LastKnownPid,
    /// Creation time, seconds since the UNIX epoch.
    pub created_at: u64,
}

/// A rule that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRule {
    pub spec: ForwardSpec,
    pub owner: UserId,
    pub last_known_pid: LastKnownPid,
}

fn parse_port(label: &str, raw: &str) -> KeeperResult<u16> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(KeeperError::InvalidParameters(format!("{label} is required")));
    }
    let value: u32 = trimmed.parse().map_err(|_| {
        KeeperError::InvalidParameters(format!("{label} '{trimmed}' is not a number"))
    })?;
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(KeeperError::InvalidParameters(format!(
            "{label} {value} is out of range (1-65535)"
        ))),
    }
}

/// Accept hostnames, IPv4 literals, and IPv6 literals (optionally
/// bracketed). The value ends up inside a forwarder address argument, so
/// anything outside the hostname alphabet is rejected.
fn validate_host(raw: &str) -> KeeperResult<String> {
    if raw.is_empty() {
        return Err(KeeperError::InvalidParameters("target host is required".into()));
    }
    if raw.len() > MAX_HOST_LEN {
        return Err(KeeperError::InvalidParameters(format!(
            "target host longer than {MAX_HOST_LEN} characters"
        )));
    }

    let unbracketed = raw
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(raw);
    if let Ok(v6) = unbracketed.parse::<Ipv6Addr>() {
        return Ok(v6.to_string());
    }

    let valid_chars = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
    if !valid_chars {
        return Err(KeeperError::InvalidParameters(format!(
            "target host '{raw}' contains invalid characters"
        )));
    }
    if raw.split('.').any(|label| label.is_empty() || label.starts_with('-')) {
        return Err(KeeperError::InvalidParameters(format!(
            "target host '{raw}' is not a valid hostname"
        )));
    }
    Ok(raw.to_string())
}
