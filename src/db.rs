//! SQLite persistence for the reviewer pool and repository registry.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{Repository, Reviewer, StoreError};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// SQLite database for the reviewer pool and repository registry.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
/// Callers should wrap operations in `tokio::task::spawn_blocking` for async
/// compatibility. The mutex doubles as the critical section that makes
/// `pop_lru_reviewer` atomic: the read-then-write runs under one lock and one
/// SQLite transaction, so concurrent pops never select from stale timestamps.
/// One writer at a time is a deliberate scaling ceiling, not an oversight.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Open or create the database file at the given path.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            return Err(StoreError::Schema(format!(
                "database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            )));
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }

        // Future migrations go here.

        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS reviewers (
                alias TEXT PRIMARY KEY,
                external_id TEXT NOT NULL DEFAULT '',
                -- Unix milliseconds; zero until first selected so new
                -- reviewers rotate in first.
                last_selected_at INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS repositories (
                project_name TEXT NOT NULL,
                name TEXT NOT NULL,
                external_repo_id TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                -- Unix milliseconds; NULL until first reconciled.
                last_reconciled_at INTEGER,
                PRIMARY KEY (project_name, name)
            );
            "#,
        )?;

        Ok(())
    }

    // =========================================================================
    // Reviewer pool
    // =========================================================================

    pub fn get_reviewer(&self, alias: &str) -> Result<Reviewer, StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.query_row(
            "SELECT alias, external_id, last_selected_at FROM reviewers WHERE alias = ?1",
            params![alias],
            row_to_reviewer,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    /// Insert a reviewer, or fully replace the existing record.
    pub fn upsert_reviewer(&self, reviewer: &Reviewer) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.execute(
            "INSERT INTO reviewers (alias, external_id, last_selected_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(alias) DO UPDATE SET
                 external_id = excluded.external_id,
                 last_selected_at = excluded.last_selected_at",
            params![
                reviewer.alias,
                reviewer.external_id,
                reviewer.last_selected_at.timestamp_millis()
            ],
        )?;

        Ok(())
    }

    /// Pop the least-recently-used reviewer from the candidate set.
    ///
    /// Ties break by alias lexical order to keep the operation deterministic.
    /// The chosen record's `last_selected_at` is set to `now`; the returned
    /// record is the pre-update one, so the caller sees who was chosen while
    /// the store already reflects the choice.
    pub fn pop_lru_reviewer(
        &self,
        candidates: &[String],
        now: DateTime<Utc>,
    ) -> Result<Reviewer, StoreError> {
        if candidates.is_empty() {
            return Err(StoreError::NotFound);
        }

        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;

        let placeholders = vec!["?"; candidates.len()].join(",");
        let sql = format!(
            "SELECT alias, external_id, last_selected_at FROM reviewers
             WHERE alias IN ({placeholders})
             ORDER BY last_selected_at ASC, alias ASC
             LIMIT 1"
        );

        let reviewer = tx
            .query_row(
                &sql,
                rusqlite::params_from_iter(candidates.iter()),
                row_to_reviewer,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;

        tx.execute(
            "UPDATE reviewers SET last_selected_at = ?1 WHERE alias = ?2",
            params![now.timestamp_millis(), reviewer.alias],
        )?;
        tx.commit()?;

        Ok(reviewer)
    }

    // =========================================================================
    // Repository registry
    // =========================================================================

    /// Register a repository. Re-registering an existing one only updates
    /// the `enabled` flag; the reconciled host id and timestamp are kept.
    pub fn add_repository(&self, repo: &Repository) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.execute(
            "INSERT INTO repositories
                 (project_name, name, external_repo_id, enabled, last_reconciled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(project_name, name) DO UPDATE SET
                 enabled = excluded.enabled",
            params![
                repo.project_name,
                repo.name,
                repo.external_repo_id,
                repo.enabled,
                repo.last_reconciled_at.map(|t| t.timestamp_millis())
            ],
        )?;

        Ok(())
    }

    pub fn get_repository(&self, project: &str, name: &str) -> Result<Repository, StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.query_row(
            "SELECT project_name, name, external_repo_id, enabled, last_reconciled_at
             FROM repositories WHERE project_name = ?1 AND name = ?2",
            params![project, name],
            row_to_repository,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    pub fn list_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let mut stmt = conn.prepare(
            "SELECT project_name, name, external_repo_id, enabled, last_reconciled_at
             FROM repositories ORDER BY project_name, name",
        )?;
        let repos = stmt
            .query_map([], row_to_repository)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    pub fn set_repository_enabled(
        &self,
        project: &str,
        name: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let changed = conn.execute(
            "UPDATE repositories SET enabled = ?1 WHERE project_name = ?2 AND name = ?3",
            params![enabled, project, name],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(())
    }

    pub fn set_repository_external_id(
        &self,
        project: &str,
        name: &str,
        external_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let changed = conn.execute(
            "UPDATE repositories SET external_repo_id = ?1
             WHERE project_name = ?2 AND name = ?3",
            params![external_id, project, name],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(())
    }

    pub fn stamp_repository_reconciled(
        &self,
        project: &str,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let changed = conn.execute(
            "UPDATE repositories SET last_reconciled_at = ?1
             WHERE project_name = ?2 AND name = ?3",
            params![at.timestamp_millis(), project, name],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(())
    }
}

fn row_to_reviewer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reviewer> {
    let millis: i64 = row.get(2)?;
    Ok(Reviewer {
        alias: row.get(0)?,
        external_id: row.get(1)?,
        last_selected_at: DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH),
    })
}

fn row_to_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    let millis: Option<i64> = row.get(4)?;
    Ok(Repository {
        project_name: row.get(0)?,
        name: row.get(1)?,
        external_repo_id: row.get(2)?,
        enabled: row.get(3)?,
        last_reconciled_at: millis.and_then(DateTime::from_timestamp_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reviewer(alias: &str, selected_at: i64) -> Reviewer {
        Reviewer {
            alias: alias.to_string(),
            external_id: String::new(),
            last_selected_at: Utc.timestamp_millis_opt(selected_at).unwrap(),
        }
    }

    fn candidates(aliases: &[&str]) -> Vec<String> {
        aliases.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_get_reviewer_not_found() {
        let db = SqliteDb::new_in_memory().expect("should create db");
        assert!(matches!(
            db.get_reviewer("ghost"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_upsert_is_full_replace() {
        let db = SqliteDb::new_in_memory().expect("should create db");

        db.upsert_reviewer(&reviewer("alice", 0)).unwrap();
        let mut updated = reviewer("alice", 500);
        updated.external_id = "ext-1".to_string();
        db.upsert_reviewer(&updated).unwrap();

        let stored = db.get_reviewer("alice").unwrap();
        assert_eq!(stored.external_id, "ext-1");
        assert_eq!(stored.last_selected_at.timestamp_millis(), 500);
    }

    #[test]
    fn test_pop_lru_cycles_through_candidates() {
        let db = SqliteDb::new_in_memory().expect("should create db");
        db.upsert_reviewer(&reviewer("a", 100)).unwrap();
        db.upsert_reviewer(&reviewer("b", 200)).unwrap();
        db.upsert_reviewer(&reviewer("c", 300)).unwrap();

        let set = candidates(&["a", "b", "c"]);
        let t = |millis| Utc.timestamp_millis_opt(millis).unwrap();

        // Three pops return a, b, c in ascending last_selected_at order.
        assert_eq!(db.pop_lru_reviewer(&set, t(1000)).unwrap().alias, "a");
        assert_eq!(db.pop_lru_reviewer(&set, t(2000)).unwrap().alias, "b");
        assert_eq!(db.pop_lru_reviewer(&set, t(3000)).unwrap().alias, "c");

        // A fourth pop wraps around to the first returned.
        assert_eq!(db.pop_lru_reviewer(&set, t(4000)).unwrap().alias, "a");
    }

    #[test]
    fn test_pop_lru_ties_break_by_alias() {
        let db = SqliteDb::new_in_memory().expect("should create db");
        db.upsert_reviewer(&reviewer("zed", 100)).unwrap();
        db.upsert_reviewer(&reviewer("amy", 100)).unwrap();

        let popped = db
            .pop_lru_reviewer(&candidates(&["zed", "amy"]), Utc::now())
            .unwrap();
        assert_eq!(popped.alias, "amy");
    }

    #[test]
    fn test_pop_lru_returns_pre_update_record() {
        let db = SqliteDb::new_in_memory().expect("should create db");
        db.upsert_reviewer(&reviewer("a", 100)).unwrap();

        let now = Utc.timestamp_millis_opt(9000).unwrap();
        let popped = db.pop_lru_reviewer(&candidates(&["a"]), now).unwrap();
        assert_eq!(popped.last_selected_at.timestamp_millis(), 100);

        let stored = db.get_reviewer("a").unwrap();
        assert_eq!(stored.last_selected_at.timestamp_millis(), 9000);
    }

    #[test]
    fn test_pop_lru_disjoint_candidates_not_found() {
        let db = SqliteDb::new_in_memory().expect("should create db");
        db.upsert_reviewer(&reviewer("a", 100)).unwrap();

        assert!(matches!(
            db.pop_lru_reviewer(&candidates(&["x", "y"]), Utc::now()),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            db.pop_lru_reviewer(&[], Utc::now()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_pop_lru_ignores_non_candidates() {
        let db = SqliteDb::new_in_memory().expect("should create db");
        db.upsert_reviewer(&reviewer("oldest", 1)).unwrap();
        db.upsert_reviewer(&reviewer("candidate", 500)).unwrap();

        let popped = db
            .pop_lru_reviewer(&candidates(&["candidate"]), Utc::now())
            .unwrap();
        assert_eq!(popped.alias, "candidate");
    }

    #[test]
    fn test_repository_roundtrip_and_stamps() {
        let db = SqliteDb::new_in_memory().expect("should create db");

        let repo = Repository {
            project_name: "Azure".to_string(),
            name: "networking".to_string(),
            external_repo_id: String::new(),
            enabled: true,
            last_reconciled_at: None,
        };
        db.add_repository(&repo).unwrap();

        let stored = db.get_repository("Azure", "networking").unwrap();
        assert!(stored.enabled);
        assert!(stored.last_reconciled_at.is_none());
        assert!(stored.external_repo_id.is_empty());

        db.set_repository_external_id("Azure", "networking", "repo-guid")
            .unwrap();
        let at = Utc.timestamp_millis_opt(42_000).unwrap();
        db.stamp_repository_reconciled("Azure", "networking", at)
            .unwrap();
        db.set_repository_enabled("Azure", "networking", false)
            .unwrap();

        let stored = db.get_repository("Azure", "networking").unwrap();
        assert_eq!(stored.external_repo_id, "repo-guid");
        assert_eq!(stored.last_reconciled_at, Some(at));
        assert!(!stored.enabled);
    }

    #[test]
    fn test_re_adding_repository_keeps_reconciled_state() {
        let db = SqliteDb::new_in_memory().expect("should create db");

        let repo = Repository {
            project_name: "Azure".to_string(),
            name: "networking".to_string(),
            external_repo_id: String::new(),
            enabled: true,
            last_reconciled_at: None,
        };
        db.add_repository(&repo).unwrap();
        db.set_repository_external_id("Azure", "networking", "repo-guid")
            .unwrap();
        let at = Utc.timestamp_millis_opt(42_000).unwrap();
        db.stamp_repository_reconciled("Azure", "networking", at)
            .unwrap();

        // A duplicate registration only toggles the enabled flag.
        let mut again = repo.clone();
        again.enabled = false;
        db.add_repository(&again).unwrap();

        let stored = db.get_repository("Azure", "networking").unwrap();
        assert_eq!(stored.external_repo_id, "repo-guid");
        assert_eq!(stored.last_reconciled_at, Some(at));
        assert!(!stored.enabled);
    }

    #[test]
    fn test_unknown_repository_updates_not_found() {
        let db = SqliteDb::new_in_memory().expect("should create db");
        assert!(matches!(
            db.set_repository_enabled("p", "r", true),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            db.stamp_repository_reconciled("p", "r", Utc::now()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_persistence_survives_reload() {
        let temp_dir = std::env::temp_dir();
        let db_path = temp_dir.join(format!("test_review_balancer_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&db_path);

        {
            let db = SqliteDb::new(&db_path).expect("should create db");
            db.upsert_reviewer(&reviewer("alice", 123)).unwrap();
        }

        {
            let db = SqliteDb::new(&db_path).expect("should reopen db");
            let stored = db.get_reviewer("alice").unwrap();
            assert_eq!(stored.last_selected_at.timestamp_millis(), 123);
        }

        let _ = std::fs::remove_file(&db_path);
    }
}
