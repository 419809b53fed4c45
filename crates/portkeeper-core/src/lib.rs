//! portkeeper-core: shared library for the portkeeper forwarding manager.
//!
//! Provides the forwarding rule model and its validation, the error
//! taxonomy, control-protocol messages with their CBOR framing, and
//! password hashing for control accounts.

pub mod codec;
pub mod error;
pub mod messages;
pub mod password;
pub mod rule;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, frame_encode, FrameDecoder};
pub use error::{KeeperError, KeeperResult, LaunchError, TerminationError};
pub use messages::{ControlRequest, ControlResponse, Credentials, ErrorKind, Operation};
pub use rule::{ForwardSpec, ForwardingRule, LastKnownPid, NewRule, RuleId, RuleParams, UserId};
