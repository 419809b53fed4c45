//! Durable record store for forwarding rules and control accounts.
//!
//! The lifecycle manager keeps no rule cache: every read goes through
//! [`RuleStore`] and every mutation is durable once the call returns.

pub mod sqlite;

pub use sqlite::SqliteStateStore;

use portkeeper_core::{ForwardingRule, KeeperResult, LastKnownPid, NewRule, RuleId, UserId};

/// Persistence interface for forwarding rules.
///
/// Implementations must make each call atomic and durable on return.
pub trait RuleStore: Send + Sync {
    /// All rules, ordered by id.
    fn get_all(&self) -> KeeperResult<Vec<ForwardingRule>>;

    fn get_by_id(&self, id: RuleId) -> KeeperResult<Option<ForwardingRule>>;

    /// Persist a new rule and return its freshly assigned id.
    fn insert(&self, rule: NewRule) -> KeeperResult<RuleId>;

    /// Replace the recorded forwarder pid. Fails with `NotFound` if the rule
    /// is gone.
    fn update_process_handle(&self, id: RuleId, pid: LastKnownPid) -> KeeperResult<()>;

    /// Remove a rule. Fails with `NotFound` if the rule is gone.
    fn delete(&self, id: RuleId) -> KeeperResult<()>;

    /// Rules owned by `owner`, ordered by id.
    fn get_by_owner(&self, owner: UserId) -> KeeperResult<Vec<ForwardingRule>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|r| r.owner == owner)
            .collect())
    }
}

/// A control-protocol account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: UserId,
    pub username: String,
    /// Argon2id PHC string.
    pub password_hash: String,
}

/// Persistence interface for accounts.
pub trait AccountStore: Send + Sync {
    fn find_account(&self, username: &str) -> KeeperResult<Option<Account>>;

    /// Create an account. Fails if the username is taken.
    fn insert_account(&self, username: &str, password_hash: &str) -> KeeperResult<UserId>;

    fn account_count(&self) -> KeeperResult<usize>;
}
