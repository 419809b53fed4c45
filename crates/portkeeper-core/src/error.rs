use crate::rule::RuleId;
use thiserror::Error;

/// Errors produced while launching a forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    /// The parameters could not be turned into a forwarder invocation.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The forwarder could not be started, or exited immediately.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
}

/// Errors produced while stopping a forwarder.
///
/// A process that no longer exists is not an error; see
/// `TerminationOutcome::AlreadyGone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminationError {
    #[error("permission denied signalling pid {0}")]
    PermissionDenied(u32),

    #[error("stop request for pid {pid} rejected: {reason}")]
    Os { pid: u32, reason: String },

    #[error("stop request for pid {0} timed out")]
    TimedOut(u32),
}

/// Errors produced by portkeeper.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("termination failed: {0}")]
    Termination(#[from] TerminationError),

    #[error("not authorized to modify rule {0}")]
    Unauthorized(RuleId),

    #[error("rule not found: {0}")]
    NotFound(RuleId),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("too many attempts, try again later")]
    RateLimited,

    #[error("store error: {0}")]
    Store(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<LaunchError> for KeeperError {
    fn from(e: LaunchError) -> Self {
        match e {
            LaunchError::InvalidParameters(msg) => KeeperError::InvalidParameters(msg),
            LaunchError::SpawnFailed(msg) => KeeperError::SpawnFailed(msg),
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for KeeperError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        KeeperError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for KeeperError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        KeeperError::Codec(e.to_string())
    }
}

pub type KeeperResult<T> = Result<T, KeeperError>;
