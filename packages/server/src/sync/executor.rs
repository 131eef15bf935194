//! The executor: a `job_type → handler` registry.
//!
//! Handlers are boxed async closures over shared dependencies; the
//! registry is the only dispatch point, and every envelope a handler
//! returns is run through the contract validator before anything else
//! sees it. A handler that violates the contract is rewritten into
//! `{success: false, error_category: contract_error}`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{error, warn};

use super::payload::{JobPayload, SyncMode};
use super::queue::SyncJob;
use super::result::{validate_sync_result, ErrorCategory, SyncResult};
use crate::artifacts::ArtifactStore;
use crate::common::redact::redact;
use crate::config::Config;
use crate::store::Repo;

/// Shared dependencies handed to every handler.
pub struct SyncDeps {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl SyncDeps {
    pub fn new(pool: PgPool, config: Arc<Config>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            pool,
            config,
            artifacts,
        }
    }
}

type BoxedHandler = Box<
    dyn Fn(
            Arc<SyncDeps>,
            Repo,
            SyncMode,
            JobPayload,
        ) -> Pin<Box<dyn Future<Output = Result<SyncResult>> + Send>>
        + Send
        + Sync,
>;

/// Registry mapping job types to their sync handlers.
#[derive(Default)]
pub struct SyncExecutor {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl SyncExecutor {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for one job type.
    pub fn register<F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        F: Fn(Arc<SyncDeps>, Repo, SyncMode, JobPayload) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<SyncResult>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |deps, repo, mode, payload| {
            let handler = handler.clone();
            Box::pin(async move { handler(deps, repo, mode, payload).await })
        });
        self.handlers.insert(job_type, boxed);
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    /// Dispatch one claimed job. Never returns `Err`: every failure mode
    /// is folded into the envelope with a canonical category.
    pub async fn execute(&self, deps: Arc<SyncDeps>, job: &SyncJob) -> SyncResult {
        let Some(handler) = self.handlers.get(job.job_type.as_str()) else {
            return SyncResult::for_error(
                format!("no handler registered for `{}`", job.job_type),
                ErrorCategory::UnknownJobType,
            );
        };

        let repo = match Repo::find_by_id(&deps.pool, job.repo_id).await {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                return SyncResult::for_error(
                    format!("repo {} does not exist", job.repo_id),
                    ErrorCategory::RepoNotFound,
                )
            }
            Err(e) => {
                return SyncResult::for_error(redact(&e.to_string()), ErrorCategory::Connection)
            }
        };

        let payload = job.payload();
        let mode = job.mode_enum();

        let result = match handler(deps, repo, mode, payload).await {
            Ok(result) => result,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "handler returned an error");
                SyncResult::for_error(redact(&e.to_string()), ErrorCategory::Exception)
            }
        };

        self.enforce_contract(job, result)
    }

    /// Convenience for tooling: dispatch from a raw job row (as JSON) and
    /// return the envelope as JSON.
    pub async fn execute_from_job_value(&self, deps: Arc<SyncDeps>, job: &Value) -> Value {
        let job: SyncJob = match serde_json::from_value(job.clone()) {
            Ok(job) => job,
            Err(e) => {
                let result = SyncResult::for_error(
                    format!("malformed job row: {e}"),
                    ErrorCategory::ContractError,
                );
                return serde_json::to_value(result).unwrap_or(Value::Null);
            }
        };
        let result = self.execute(deps, &job).await;
        serde_json::to_value(result).unwrap_or(Value::Null)
    }

    /// Run the envelope through the contract validator.
    fn enforce_contract(&self, job: &SyncJob, result: SyncResult) -> SyncResult {
        let mut value = match serde_json::to_value(&result) {
            Ok(value) => value,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "result not serializable");
                return SyncResult::for_error(
                    "result envelope not serializable".to_string(),
                    ErrorCategory::ContractError,
                );
            }
        };

        match validate_sync_result(&mut value) {
            Ok(report) => {
                for warning in report.warnings {
                    warn!(job_id = %job.job_id, warning, "result contract warning");
                }
                result
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "result violates contract");
                SyncResult::for_error(e.to_string(), ErrorCategory::ContractError)
            }
        }
    }
}

/// Thread-safe registry handle.
pub type SharedSyncExecutor = Arc<SyncExecutor>;

/// Registry with the built-in handlers registered.
pub fn default_executor() -> SyncExecutor {
    use super::handlers;

    let mut executor = SyncExecutor::new();
    executor.register("gitlab_commits", |deps, repo, mode, payload| {
        handlers::gitlab_commits::sync(deps, repo, mode, payload)
    });
    executor.register("gitlab_mrs", |deps, repo, mode, payload| {
        handlers::gitlab_mrs::sync(deps, repo, mode, payload)
    });
    executor.register("svn", |deps, repo, mode, payload| {
        handlers::svn::sync(deps, repo, mode, payload)
    });
    executor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_executor_registers_builtin_types() {
        let executor = default_executor();
        assert!(executor.is_registered("gitlab_commits"));
        assert!(executor.is_registered("gitlab_mrs"));
        assert!(executor.is_registered("svn"));
        assert!(!executor.is_registered("perforce"));
    }

    #[test]
    fn registered_types_lists_all() {
        let executor = default_executor();
        let mut types = executor.registered_types();
        types.sort_unstable();
        assert_eq!(types, ["gitlab_commits", "gitlab_mrs", "svn"]);
    }
}
