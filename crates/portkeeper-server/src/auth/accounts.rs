//! Password accounts: default-admin bootstrap and credential checks.

use crate::store::AccountStore;
use portkeeper_core::password::{hash_password, verify_password};
use portkeeper_core::{Credentials, KeeperError, KeeperResult, UserId};
use tracing::{debug, info, warn};

/// What [`bootstrap_admin`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Created(UserId),
    AlreadyPresent(UserId),
}

impl BootstrapOutcome {
    pub fn user_id(self) -> UserId {
        match self {
            BootstrapOutcome::Created(id) | BootstrapOutcome::AlreadyPresent(id) => id,
        }
    }
}

/// Make sure the default administrator account exists.
///
/// An existing account with that name is left alone, including its password.
pub fn bootstrap_admin(
    store: &dyn AccountStore,
    username: &str,
    password: &str,
) -> KeeperResult<BootstrapOutcome> {
    if let Some(existing) = store.find_account(username)? {
        debug!(username, user_id = %existing.id, "admin account already present");
        return Ok(BootstrapOutcome::AlreadyPresent(existing.id));
    }

    let hash = hash_password(password)?;
    let id = store.insert_account(username, &hash)?;
    info!(username, user_id = %id, "created default admin account");
    if password == username {
        warn!(username, "default admin password equals the username, change it in the config");
    }
    Ok(BootstrapOutcome::Created(id))
}

/// Resolve credentials to the owning user id.
///
/// Unknown usernames and wrong passwords fail the same way. Verification
/// costs one Argon2 hash; async callers run this on the blocking pool.
pub fn authenticate(store: &dyn AccountStore, credentials: &Credentials) -> KeeperResult<UserId> {
    let account = store.find_account(&credentials.username)?;
    match account {
        Some(account) if verify_password(&account.password_hash, &credentials.password) => {
            Ok(account.id)
        }
        _ => Err(KeeperError::AuthFailed(
            "invalid username or password".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStateStore;

    fn creds(user: &str, pass: &str) -> Credentials {
        Credentials {
            username: user.into(),
            password: pass.into(),
        }
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let store = SqliteStateStore::in_memory().unwrap();
        let first = bootstrap_admin(&store, "admin", "s3cret").unwrap();
        let second = bootstrap_admin(&store, "admin", "other").unwrap();

        assert!(matches!(first, BootstrapOutcome::Created(_)));
        assert_eq!(second, BootstrapOutcome::AlreadyPresent(first.user_id()));
        assert_eq!(store.account_count().unwrap(), 1);
        // The second call must not reset the password.
        assert_eq!(authenticate(&store, &creds("admin", "s3cret")).unwrap(), first.user_id());
    }

    #[test]
    fn bootstrap_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portkeeper.db");
        let id = {
            let store = SqliteStateStore::open(&path).unwrap();
            bootstrap_admin(&store, "admin", "admin").unwrap().user_id()
        };
        let store = SqliteStateStore::open(&path).unwrap();
        assert_eq!(
            bootstrap_admin(&store, "admin", "admin").unwrap(),
            BootstrapOutcome::AlreadyPresent(id)
        );
    }

    #[test]
    fn wrong_password_and_unknown_user_fail_alike() {
        let store = SqliteStateStore::in_memory().unwrap();
        bootstrap_admin(&store, "admin", "pw").unwrap();

        let wrong = authenticate(&store, &creds("admin", "nope")).unwrap_err();
        let unknown = authenticate(&store, &creds("ghost", "pw")).unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert!(matches!(wrong, KeeperError::AuthFailed(_)));
    }
}
