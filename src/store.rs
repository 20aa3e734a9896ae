//! Async facade over the SQLite store.
//!
//! SQLite calls are blocking, so every operation hops onto the blocking
//! thread pool. Atomicity of `pop_lru_reviewer` lives inside `SqliteDb`;
//! this layer only adds the async boundary.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::SqliteDb;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("blocking task panicked")]
    TaskPanicked,
}

/// A member of the shared reviewer pool.
///
/// `alias` is the unique natural key and the only cross-entity join key.
/// `external_id` stays empty until the identity directory resolves it.
/// `last_selected_at` is mutated exclusively by `pop_lru_reviewer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reviewer {
    pub alias: String,
    pub external_id: String,
    pub last_selected_at: DateTime<Utc>,
}

impl Reviewer {
    /// A freshly discovered reviewer: epoch-selected, so it rotates in first.
    pub fn new(alias: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            external_id: external_id.into(),
            last_selected_at: DateTime::UNIX_EPOCH,
        }
    }
}

/// A registered repository. Owns no reviewer records; the pool is shared
/// across repositories and linked only by alias at selection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub project_name: String,
    pub name: String,
    /// Lazily resolved host identifier; empty until the first reconcile.
    pub external_repo_id: String,
    pub enabled: bool,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

/// Shared handle to the durable reviewer pool and repository registry.
#[derive(Clone)]
pub struct Store {
    db: Arc<SqliteDb>,
}

impl Store {
    pub fn new(db_path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            db: Arc::new(SqliteDb::new(db_path)?),
        })
    }

    /// In-memory store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            db: Arc::new(SqliteDb::new_in_memory()?),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteDb) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|_| StoreError::TaskPanicked)?
    }

    pub async fn get_reviewer(&self, alias: &str) -> Result<Reviewer, StoreError> {
        let alias = alias.to_string();
        self.blocking(move |db| db.get_reviewer(&alias)).await
    }

    pub async fn upsert_reviewer(&self, reviewer: Reviewer) -> Result<(), StoreError> {
        self.blocking(move |db| db.upsert_reviewer(&reviewer)).await
    }

    /// Atomically pop the least-recently-used reviewer from `candidates`.
    pub async fn pop_lru_reviewer(
        &self,
        candidates: Vec<String>,
    ) -> Result<Reviewer, StoreError> {
        self.blocking(move |db| db.pop_lru_reviewer(&candidates, Utc::now()))
            .await
    }

    pub async fn add_repository(&self, repo: Repository) -> Result<(), StoreError> {
        self.blocking(move |db| db.add_repository(&repo)).await
    }

    pub async fn get_repository(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Repository, StoreError> {
        let project = project.to_string();
        let name = name.to_string();
        self.blocking(move |db| db.get_repository(&project, &name))
            .await
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        self.blocking(|db| db.list_repositories()).await
    }

    pub async fn list_enabled_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        let repos = self.list_repositories().await?;
        Ok(repos.into_iter().filter(|r| r.enabled).collect())
    }

    pub async fn set_repository_enabled(
        &self,
        project: &str,
        name: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let project = project.to_string();
        let name = name.to_string();
        self.blocking(move |db| db.set_repository_enabled(&project, &name, enabled))
            .await
    }

    pub async fn set_repository_external_id(
        &self,
        project: &str,
        name: &str,
        external_id: &str,
    ) -> Result<(), StoreError> {
        let project = project.to_string();
        let name = name.to_string();
        let external_id = external_id.to_string();
        self.blocking(move |db| db.set_repository_external_id(&project, &name, &external_id))
            .await
    }

    pub async fn stamp_repository_reconciled(
        &self,
        project: &str,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let project = project.to_string();
        let name = name.to_string();
        self.blocking(move |db| db.stamp_repository_reconciled(&project, &name, at))
            .await
    }
}
