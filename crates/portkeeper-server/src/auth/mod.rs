//! Control-protocol accounts and login throttling.

pub mod accounts;
pub mod rate_limit;

pub use accounts::{authenticate, bootstrap_admin};
pub use rate_limit::LoginRateLimiter;
