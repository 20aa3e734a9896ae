//! Collaborator interfaces for the source-control host.
//!
//! The balancer and reconciler only ever talk to the host through these
//! traits, so tests can substitute an in-memory fake and the real REST
//! client stays a thin transport wrapper.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    /// The requested resource does not exist (HTTP 404). Frequently an
    /// expected control-flow signal, e.g. "no owners file here, try the
    /// parent directory".
    #[error("resource not found")]
    NotFound,

    /// The host was unreachable, timed out, or returned a non-2xx status
    /// other than 404.
    #[error("host request failed: {0}")]
    Transport(String),

    /// The host handed back a continuation token that made no progress.
    #[error("pagination failed: {0}")]
    Pagination(String),
}

/// Transient projection of an upstream pull request. Never persisted.
#[derive(Debug, Clone)]
pub struct PullRequestView {
    pub id: u64,
    pub repository_id: String,
    pub author_id: String,
    /// Alias derived from the author's unique name, when the host exposes one.
    pub author_alias: Option<String>,
    pub title: String,
    pub target_branch: String,
    pub url: String,
}

/// A repository as listed by the host under a project.
#[derive(Debug, Clone)]
pub struct RemoteRepository {
    pub name: String,
    pub external_id: String,
}

/// One page of changed paths for a pull request iteration.
#[derive(Debug, Clone)]
pub struct ChangedPathsPage {
    pub paths: Vec<String>,
    /// Zero means no further pages.
    pub next_skip: u32,
}

/// A comment thread on a pull request, flattened to its comment bodies.
#[derive(Debug, Clone)]
pub struct CommentThread {
    pub comments: Vec<String>,
}

/// Operations consumed from the source-control host.
#[async_trait]
pub trait SourceHost: Send + Sync {
    async fn list_open_pull_requests(
        &self,
        repo_id: &str,
    ) -> Result<Vec<PullRequestView>, HostError>;

    /// The latest iteration number of a pull request. Iterations count up
    /// from one with each push; the latest one carries the cumulative diff.
    async fn latest_iteration(&self, repo_id: &str, pr_id: u64) -> Result<u32, HostError>;

    async fn list_changed_paths(
        &self,
        repo_id: &str,
        pr_id: u64,
        iteration: u32,
        skip: u32,
    ) -> Result<ChangedPathsPage, HostError>;

    /// Fetch the content of a file at `path`. `NotFound` if the file does
    /// not exist at the repository's default branch tip.
    async fn get_file_content(&self, repo_id: &str, path: &str) -> Result<String, HostError>;

    async fn list_comment_threads(
        &self,
        repo_id: &str,
        pr_id: u64,
    ) -> Result<Vec<CommentThread>, HostError>;

    async fn post_comment(&self, repo_id: &str, pr_id: u64, text: &str)
        -> Result<(), HostError>;

    /// Add a reviewer by external identity. The host treats this as an
    /// upsert: re-adding an existing reviewer is a no-op, which keeps a
    /// partially-applied pull request safe to retry.
    async fn add_reviewer(
        &self,
        repo_id: &str,
        pr_id: u64,
        external_id: &str,
        required: bool,
    ) -> Result<(), HostError>;

    /// Recursively list every file path in the repository.
    async fn list_repository_tree(&self, repo_id: &str) -> Result<Vec<String>, HostError>;

    async fn list_repositories(&self, project: &str)
        -> Result<Vec<RemoteRepository>, HostError>;

    /// Member aliases of a team within a project.
    async fn list_team_members(
        &self,
        project: &str,
        team: &str,
    ) -> Result<Vec<String>, HostError>;
}

/// Resolves a human alias to the host system's opaque identity.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn resolve_alias(&self, alias: &str) -> Result<String, HostError>;
}
