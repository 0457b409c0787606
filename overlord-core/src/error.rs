//! Error taxonomy.
//!
//! Domain failures get typed errors so callers can branch on them; adapter
//! and binary edges stay on `anyhow` and propagate with `?`. Transient
//! external failures (queue, chat, runtime I/O) never surface here at all:
//! the owning adapter logs and returns a conservative value instead.

use thiserror::Error;

/// Failures of the state store (C1).
#[derive(Debug, Error)]
pub enum StoreError {
    /// An active minion already exists for this (repo, issue) pair.
    #[error("already working on {repo}#{issue_number}")]
    Duplicate { repo: String, issue_number: u64 },

    /// No active minion with this id.
    #[error("no active minion `{0}`")]
    NotFound(String),

    /// `record_completion` was retried after the minion was archived.
    #[error("minion `{0}` is already archived")]
    AlreadyArchived(String),

    /// The database was written by a newer schema version.
    #[error("state db schema version {0} is newer than this build supports")]
    SchemaTooNew(i64),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Reasons the dispatch pipeline refuses or fails to start a minion.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("container runtime is not available")]
    RuntimeUnavailable,

    #[error("max concurrent minions ({0}) reached")]
    CapReached(usize),

    #[error("already working on {repo}#{issue_number} (minion `{minion_id}`)")]
    AlreadyActive {
        repo: String,
        issue_number: u64,
        minion_id: String,
    },

    #[error("failed to spawn minion container: {0}")]
    Spawn(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fatal start-up failure: the configuration does not describe a runnable
/// process. Collected in full so the operator sees every problem at once.
#[derive(Debug, Error)]
#[error("invalid configuration:\n  {}", .problems.join("\n  "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}
