//! The fact store: schema-prefixed Postgres persistence.
//!
//! Every table lives in one of the `logbook`, `scm` or `governance`
//! schemas; queries use unqualified names and rely on the per-pool
//! `search_path` configured by [`schema::SchemaContext`].

pub mod commit;
pub mod kv;
pub mod repo;
pub mod run;
pub mod schema;
pub mod status;

pub use commit::{GitCommitRow, PatchBlob, SvnRevisionRow};
pub use kv::{NAMESPACE_SYNC_HEALTH, NAMESPACE_SYNC_PAUSES};
pub use repo::{Repo, RepoType};
pub use run::{RunStatus, SyncRun};
pub use schema::{connect_pool, SchemaContext};
pub use status::{get_sync_status_summary, StatusSummary};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Fatal; the caller must not retry.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
