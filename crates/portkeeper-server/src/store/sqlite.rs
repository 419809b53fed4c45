//! SQLite state store.
//!
//! Accounts and rules live in one database file opened in WAL mode with
//! `synchronous = FULL`, so a call that returned is on disk. Ids come from
//! `AUTOINCREMENT` columns and are never handed out twice, even after the
//! highest row was deleted.

use super::{Account, AccountStore, RuleStore};
use portkeeper_core::{
    ForwardSpec, ForwardingRule, KeeperError, KeeperResult, LastKnownPid, NewRule, RuleId, UserId,
};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const SCHEMA_VERSION: i32 = 1;

const RULE_COLUMNS: &str =
    "id, listen_port, target_host, target_port, owner, last_known_pid, created_at";

/// SQLite-backed implementation of [`RuleStore`] and [`AccountStore`].
///
/// One connection behind a mutex; callers on the async runtime go through
/// the blocking pool.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> KeeperResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(store_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| KeeperError::Store(format!("cannot open {}: {e}", path.display())))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(store_err)?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(store_err)?;

        let store = Self::with_connection(conn)?;
        info!(
            path = %path.display(),
            rules = store.rule_count()?,
            accounts = store.account_count()?,
            "state database opened"
        );
        Ok(store)
    }

    /// Create a store that lives only in memory.
    pub fn in_memory() -> KeeperResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(mut conn: Connection) -> KeeperResult<Self> {
        init_schema(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> KeeperResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| KeeperError::Store("database lock poisoned".into()))
    }

    fn rule_count(&self) -> KeeperResult<usize> {
        let count: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))
            .map_err(store_err)?;
        Ok(count as usize)
    }

    fn query_rules(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> KeeperResult<Vec<ForwardingRule>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {RULE_COLUMNS} FROM rules {filter} ORDER BY id");
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params, RuleRow::from_row)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter().map(RuleRow::into_rule).collect()
    }
}

fn init_schema(conn: &mut Connection) -> KeeperResult<()> {
    let tx = conn.transaction().map_err(store_err)?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            listen_port INTEGER NOT NULL,
            target_host TEXT NOT NULL,
            target_port INTEGER NOT NULL,
            owner INTEGER NOT NULL,
            last_known_pid INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_rules_owner ON rules(owner);
        "#,
    )
    .map_err(store_err)?;

    let version: Option<i32> = tx
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .map_err(store_err)?;
    match version {
        None => {
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![SCHEMA_VERSION, unix_now() as i64],
            )
            .map_err(store_err)?;
            debug!(version = SCHEMA_VERSION, "created state schema");
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => {
            return Err(KeeperError::Store(format!(
                "unsupported schema version {v} (expected {SCHEMA_VERSION})"
            )))
        }
    }

    tx.commit().map_err(store_err)
}

/// Raw column values; validated into a [`ForwardingRule`] outside the row
/// callback.
struct RuleRow {
    id: i64,
    listen_port: u16,
    target_host: String,
    target_port: u16,
    owner: i64,
    last_known_pid: u32,
    created_at: i64,
}

impl RuleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            listen_port: row.get(1)?,
            target_host: row.get(2)?,
            target_port: row.get(3)?,
            owner: row.get(4)?,
            last_known_pid: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_rule(self) -> KeeperResult<ForwardingRule> {
        let spec = ForwardSpec::new(self.listen_port, &self.target_host, self.target_port)
            .map_err(|e| KeeperError::Store(format!("rule {} is corrupt: {e}", self.id)))?;
        Ok(ForwardingRule {
            id: RuleId(self.id as u64),
            spec,
            owner: UserId(self.owner as u64),
            last_known_pid: LastKnownPid(self.last_known_pid),
            created_at: self.created_at as u64,
        })
    }
}

impl RuleStore for SqliteStateStore {
    fn get_all(&self) -> KeeperResult<Vec<ForwardingRule>> {
        self.query_rules("", [])
    }

    fn get_by_id(&self, id: RuleId) -> KeeperResult<Option<ForwardingRule>> {
        Ok(self
            .query_rules("WHERE id = ?1", [id.0 as i64])?
            .into_iter()
            .next())
    }

    fn insert(&self, rule: NewRule) -> KeeperResult<RuleId> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO rules (listen_port, target_host, target_port, owner, last_known_pid, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                rule.spec.listen_port(),
                rule.spec.target_host(),
                rule.spec.target_port(),
                rule.owner.0 as i64,
                rule.last_known_pid.get(),
                unix_now() as i64,
            ],
        )
        .map_err(store_err)?;
        let id = RuleId(conn.last_insert_rowid() as u64);
        debug!(rule_id = %id, "rule inserted");
        Ok(id)
    }

    fn update_process_handle(&self, id: RuleId, pid: LastKnownPid) -> KeeperResult<()> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE rules SET last_known_pid = ?1 WHERE id = ?2",
                rusqlite::params![pid.get(), id.0 as i64],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(KeeperError::NotFound(id));
        }
        Ok(())
    }

    fn delete(&self, id: RuleId) -> KeeperResult<()> {
        let changed = self
            .lock()?
            .execute("DELETE FROM rules WHERE id = ?1", [id.0 as i64])
            .map_err(store_err)?;
        if changed == 0 {
            return Err(KeeperError::NotFound(id));
        }
        debug!(rule_id = %id, "rule deleted");
        Ok(())
    }

    fn get_by_owner(&self, owner: UserId) -> KeeperResult<Vec<ForwardingRule>> {
        self.query_rules("WHERE owner = ?1", [owner.0 as i64])
    }
}

impl AccountStore for SqliteStateStore {
    fn find_account(&self, username: &str) -> KeeperResult<Option<Account>> {
        self.lock()?
            .query_row(
                "SELECT id, username, password_hash FROM accounts WHERE username = ?1",
                [username],
                |row| {
                    Ok(Account {
                        id: UserId(row.get::<_, i64>(0)? as u64),
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(store_err)
    }

    fn insert_account(&self, username: &str, password_hash: &str) -> KeeperResult<UserId> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;
        let taken: bool = tx
            .query_row(
                "SELECT COUNT(*) > 0 FROM accounts WHERE username = ?1",
                [username],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        if taken {
            return Err(KeeperError::Store(format!(
                "account '{username}' already exists"
            )));
        }
        tx.execute(
            "INSERT INTO accounts (username, password_hash) VALUES (?1, ?2)",
            [username, password_hash],
        )
        .map_err(store_err)?;
        let id = UserId(tx.last_insert_rowid() as u64);
        tx.commit().map_err(store_err)?;
        Ok(id)
    }

    fn account_count(&self) -> KeeperResult<usize> {
        let count: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))
            .map_err(store_err)?;
        Ok(count as usize)
    }
}

fn store_err(e: rusqlite::Error) -> KeeperError {
    KeeperError::Store(e.to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_rule(listen: u16, owner: u64, pid: u32) -> NewRule {
        NewRule {
            spec: ForwardSpec::new(listen, "10.0.0.9", 80).unwrap(),
            owner: UserId(owner),
            last_known_pid: LastKnownPid(pid),
        }
    }

    #[test]
    fn rules_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portkeeper.db");

        let id = {
            let store = SqliteStateStore::open(&path).unwrap();
            let id = store.insert(new_rule(8080, 1, 100)).unwrap();
            store.update_process_handle(id, LastKnownPid(200)).unwrap();
            id
        };

        let store = SqliteStateStore::open(&path).unwrap();
        let rule = store.get_by_id(id).unwrap().unwrap();
        assert_eq!(rule.spec.listen_port(), 8080);
        assert_eq!(rule.spec.target_host(), "10.0.0.9");
        assert_eq!(rule.last_known_pid, LastKnownPid(200));
        assert_eq!(rule.owner, UserId(1));
        assert!(rule.created_at > 0);
    }

    #[test]
    fn ids_are_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portkeeper.db");

        let store = SqliteStateStore::open(&path).unwrap();
        let first = store.insert(new_rule(1000, 1, 1)).unwrap();
        store.delete(first).unwrap();
        drop(store);

        let store = SqliteStateStore::open(&path).unwrap();
        let second = store.insert(new_rule(1001, 1, 2)).unwrap();
        assert!(second > first);
    }

    #[test]
    fn get_all_is_ordered_and_filterable() {
        let store = SqliteStateStore::in_memory().unwrap();
        let a = store.insert(new_rule(1, 1, 10)).unwrap();
        let b = store.insert(new_rule(2, 2, 11)).unwrap();
        let c = store.insert(new_rule(3, 1, 12)).unwrap();

        let all: Vec<RuleId> = store.get_all().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(all, vec![a, b, c]);

        let mine: Vec<RuleId> = store
            .get_by_owner(UserId(1))
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(mine, vec![a, c]);
    }

    #[test]
    fn missing_rule_operations_fail_not_found() {
        let store = SqliteStateStore::in_memory().unwrap();
        assert!(store.get_by_id(RuleId(9)).unwrap().is_none());
        assert!(matches!(
            store.update_process_handle(RuleId(9), LastKnownPid(1)),
            Err(KeeperError::NotFound(RuleId(9)))
        ));
        assert!(matches!(store.delete(RuleId(9)), Err(KeeperError::NotFound(RuleId(9)))));
    }

    #[test]
    fn accounts_are_unique_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("portkeeper.db");

        let store = SqliteStateStore::open(&path).unwrap();
        let id = store.insert_account("admin", "hash").unwrap();
        assert!(matches!(
            store.insert_account("admin", "hash2"),
            Err(KeeperError::Store(_))
        ));
        drop(store);

        let store = SqliteStateStore::open(&path).unwrap();
        assert_eq!(store.account_count().unwrap(), 1);
        let account = store.find_account("admin").unwrap().unwrap();
        assert_eq!(account.id, id);
        assert_eq!(account.password_hash, "hash");
        assert!(store.find_account("nobody").unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portkeeper.db");
        std::fs::write(&path, vec![0x5a; 4096]).unwrap();
        assert!(matches!(SqliteStateStore::open(&path), Err(KeeperError::Store(_))));
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portkeeper.db");
        drop(SqliteStateStore::open(&path).unwrap());

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, 0)",
            [SCHEMA_VERSION + 1],
        )
        .unwrap();
        drop(conn);

        let err = SqliteStateStore::open(&path).err().unwrap();
        assert!(err.to_string().contains("unsupported schema version"), "{err}");
    }
}
