//! Control protocol messages exchanged between `portkeeper` and `portkeeperd`.
//!
//! Every request carries the caller's credentials; the daemon authenticates
//! each request on its own and answers with exactly one response frame.

use crate::error::KeeperError;
use crate::rule::{ForwardingRule, RuleId, RuleParams};
use serde::{Deserialize, Serialize};

/// Protocol version, bumped on incompatible message changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Username/password pair identifying the operator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Operation requested by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateRule(RuleParams),
    DeleteRule { rule_id: RuleId },
    ListRules,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub version: u32,
    pub credentials: Credentials,
    pub operation: Operation,
}

impl ControlRequest {
    pub fn new(credentials: Credentials, operation: Operation) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            credentials,
            operation,
        }
    }
}

/// Error categories carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameters,
    SpawnFailed,
    Termination,
    Unauthorized,
    NotFound,
    AuthFailed,
    RateLimited,
    Protocol,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidParameters => "invalid parameters",
            ErrorKind::SpawnFailed => "spawn failed",
            ErrorKind::Termination => "termination failed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not found",
            ErrorKind::AuthFailed => "authentication failed",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl From<&KeeperError> for ErrorKind {
    fn from(e: &KeeperError) -> Self {
        match e {
            KeeperError::InvalidParameters(_) => ErrorKind::InvalidParameters,
            KeeperError::SpawnFailed(_) => ErrorKind::SpawnFailed,
            KeeperError::Termination(_) => ErrorKind::Termination,
            KeeperError::Unauthorized(_) => ErrorKind::Unauthorized,
            KeeperError::NotFound(_) => ErrorKind::NotFound,
            KeeperError::AuthFailed(_) => ErrorKind::AuthFailed,
            KeeperError::RateLimited => ErrorKind::RateLimited,
            KeeperError::Codec(_) => ErrorKind::Protocol,
            KeeperError::Store(_) | KeeperError::Io(_) | KeeperError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    RuleCreated { rule: ForwardingRule },
    /// `warning` is set when the rule was removed but its forwarder had
    /// already exited.
    RuleDeleted { rule_id: RuleId, warning: Option<String> },
    Rules { rules: Vec<ForwardingRule> },
    Error { kind: ErrorKind, message: String },
}

impl ControlResponse {
    pub fn error(e: &KeeperError) -> Self {
        ControlResponse::Error {
            kind: ErrorKind::from(e),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TerminationError;

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            username: "admin".into(),
            password: "s3cret".into(),
        };
        let dbg = format!("{creds:?}");
        assert!(dbg.contains("admin"));
        assert!(!dbg.contains("s3cret"));
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(
            ErrorKind::from(&KeeperError::Unauthorized(RuleId(3))),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            ErrorKind::from(&KeeperError::Termination(TerminationError::TimedOut(9))),
            ErrorKind::Termination
        );
        assert_eq!(
            ErrorKind::from(&KeeperError::Store("disk full".into())),
            ErrorKind::Internal
        );
    }

    #[test]
    fn error_response_carries_message() {
        let resp = ControlResponse::error(&KeeperError::NotFound(RuleId(12)));
        assert_eq!(
            resp,
            ControlResponse::Error {
                kind: ErrorKind::NotFound,
                message: "rule not found: 12".into(),
            }
        );
    }
}
