//! The sync worker: a sequential claim → limit → gate → dispatch →
//! persist loop.
//!
//! Parallelism comes from running several workers, each with its own id.
//! Inside one iteration the only blocking points are the queue round
//! trips, the limiter wait and the handler's own I/O. Lease loss is
//! observed through the heartbeat side-task; once lost, the worker writes
//! nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::breaker::{BreakerDecision, CircuitBreaker};
use super::counts::build_counts_from_result;
use super::executor::{SharedSyncExecutor, SyncDeps};
use super::keys::{build_circuit_breaker_key, extract_instance_and_tenant, BreakerScope};
use super::limiter::RateLimiter;
use super::queue::{SyncJob, SyncQueue};
use super::result::{ErrorCategory, SyncResult};
use crate::common::redact::redact;
use crate::store::kv::kv_get;
use crate::store::{Repo, RunStatus, SyncRun};
use crate::sync::cursor::{gitlab_cursor_key, svn_cursor_key, CURSOR_NAMESPACE};

#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub handler_timeout: Duration,
    pub limiter_wait_max: Duration,
    pub lease_seconds: i32,
    pub job_types: Option<Vec<String>>,
    pub instance_allowlist: Option<Vec<String>>,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(600),
            limiter_wait_max: Duration::from_secs(30),
            lease_seconds: 300,
            job_types: None,
            instance_allowlist: None,
        }
    }
}

impl SyncWorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

pub struct SyncWorker {
    queue: SyncQueue,
    executor: SharedSyncExecutor,
    deps: Arc<SyncDeps>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    config: SyncWorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl SyncWorker {
    pub fn new(
        queue: SyncQueue,
        executor: SharedSyncExecutor,
        deps: Arc<SyncDeps>,
        limiter: RateLimiter,
        breaker: CircuitBreaker,
        config: SyncWorkerConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            deps,
            limiter,
            breaker,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub async fn run(self) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "sync worker starting");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let claimed = self
                .queue
                .claim_one(
                    &self.config.worker_id,
                    self.config.job_types.as_deref(),
                    self.config.instance_allowlist.as_deref(),
                    self.config.lease_seconds,
                )
                .await;

            match claimed {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "claim failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "sync worker stopped");
        Ok(())
    }

    /// Run exactly one claimed job to completion. Public so tests can
    /// drive single iterations deterministically.
    pub async fn process_job(&self, job: SyncJob) {
        let worker_id = self.config.worker_id.clone();
        let job_id = job.job_id;
        debug!(%job_id, job_type = %job.job_type, "processing job");

        let repo = match Repo::find_by_id(&self.deps.pool, job.repo_id).await {
            Ok(repo) => repo,
            Err(e) => {
                error!(%job_id, error = %e, "repo lookup failed");
                let _ = self
                    .queue
                    .fail(job_id, &worker_id, &e.to_string(), ErrorCategory::Connection)
                    .await;
                return;
            }
        };

        let project_key = repo
            .as_ref()
            .and_then(|r| r.project_key.clone())
            .unwrap_or_else(|| self.deps.config.project_key().to_string());

        let (instance_key, _tenant) = extract_instance_and_tenant(
            Some(&job.payload_json),
            repo.as_ref().map(|r| r.url.as_str()),
            Some(project_key.as_str()),
        );

        let scope = instance_key
            .clone()
            .map(BreakerScope::Instance)
            .unwrap_or(BreakerScope::Global);
        let breaker_key = build_circuit_breaker_key(&project_key, &scope);

        // Circuit gate. Rejections do not count against the retry budget.
        match self.breaker.check(&breaker_key).await {
            Ok(BreakerDecision::Allow) | Ok(BreakerDecision::Probe) => {}
            Ok(BreakerDecision::Reject { open_until }) => {
                let delay = open_until
                    .map(|until| (until - Utc::now()).num_seconds().max(1))
                    .unwrap_or(60);
                debug!(%job_id, delay, "circuit open, rescheduling");
                let _ = self
                    .queue
                    .soft_requeue(
                        job_id,
                        &worker_id,
                        Some(delay),
                        "circuit_open: breaker window active",
                    )
                    .await;
                return;
            }
            Err(e) => {
                error!(%job_id, error = %e, "breaker check failed");
                let _ = self
                    .queue
                    .fail(job_id, &worker_id, &e.to_string(), ErrorCategory::Connection)
                    .await;
                return;
            }
        }

        // Limiter permit.
        if let Some(instance_key) = &instance_key {
            match self
                .limiter
                .acquire(instance_key, self.config.limiter_wait_max)
                .await
            {
                Ok((true, _)) => {}
                Ok((false, wait_seconds)) => {
                    debug!(%job_id, wait_seconds, "limiter saturated, rescheduling");
                    let _ = self
                        .queue
                        .soft_requeue(
                            job_id,
                            &worker_id,
                            Some(wait_seconds.ceil() as i64),
                            "rate limiter saturated",
                        )
                        .await;
                    return;
                }
                Err(e) => {
                    error!(%job_id, error = %e, "limiter acquire failed");
                    let _ = self
                        .queue
                        .fail(job_id, &worker_id, &e.to_string(), ErrorCategory::Connection)
                        .await;
                    return;
                }
            }
        }

        // Durable run record.
        let cursor_before = self.cursor_snapshot(&job).await;
        let run = match SyncRun::insert_start(
            &self.deps.pool,
            job.repo_id,
            &job.job_type,
            job.mode_enum(),
            cursor_before.as_ref(),
        )
        .await
        {
            Ok(run) => run,
            Err(e) => {
                error!(%job_id, error = %e, "run start failed");
                let _ = self
                    .queue
                    .fail(job_id, &worker_id, &e.to_string(), ErrorCategory::Connection)
                    .await;
                return;
            }
        };

        // Heartbeat side-task; a false heartbeat means the lease is gone.
        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = {
            let queue = self.queue.clone();
            let lease_lost = lease_lost.clone();
            let worker_id = worker_id.clone();
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match queue.heartbeat(job_id, &worker_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            lease_lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => warn!(%job_id, error = %e, "heartbeat failed"),
                    }
                }
            })
        };

        let result = match tokio::time::timeout(
            self.config.handler_timeout,
            self.executor.execute(self.deps.clone(), &job),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                if let Some(instance_key) = &instance_key {
                    let _ = self.limiter.record_timeout(instance_key).await;
                }
                SyncResult::for_error("handler wall-clock timeout", ErrorCategory::Timeout)
            }
        };

        heartbeat.abort();

        if lease_lost.load(Ordering::SeqCst) {
            // The reaper took this job back; discard everything.
            warn!(%job_id, "lease lost mid-flight, discarding result");
            return;
        }

        self.persist_outcome(&job, &run, result, &breaker_key, instance_key.as_deref())
            .await;
    }

    async fn persist_outcome(
        &self,
        job: &SyncJob,
        run: &SyncRun,
        result: SyncResult,
        breaker_key: &str,
        instance_key: Option<&str>,
    ) {
        let worker_id = &self.config.worker_id;
        let job_id = job.job_id;
        let counts = build_counts_from_result(&result);

        // Lock-held short-circuit: soft re-queue, no budget burn.
        if result.locked && result.skipped {
            let note = result
                .message
                .clone()
                .unwrap_or_else(|| "resource lock held".to_string());
            let _ = SyncRun::finish(
                &self.deps.pool,
                run.run_id,
                RunStatus::Completed,
                Some(&counts),
                result.cursor_after.as_ref(),
                None,
                None,
                None,
            )
            .await;
            let _ = self
                .queue
                .soft_requeue(job_id, worker_id, None, &note)
                .await;
            return;
        }

        if result.success {
            let degradation = (!result.degraded_reasons.is_empty())
                .then(|| json!({ "degraded_reasons": result.degraded_reasons }));
            let evidence = json!({
                "patch_blob_count": result.diff_count,
                "source_type": job.job_type,
            });

            match SyncRun::finish(
                &self.deps.pool,
                run.run_id,
                RunStatus::Completed,
                Some(&counts),
                result.cursor_after.as_ref(),
                None,
                degradation.as_ref(),
                Some(&evidence),
            )
            .await
            {
                Ok(finished) => {
                    self.write_logbook_item(job, &finished, &result).await;
                }
                Err(e) => warn!(%job_id, error = %e, "run finish failed"),
            }

            let _ = self.queue.complete(job_id, worker_id, Some(run.run_id)).await;
            let _ = self.breaker.record_success(breaker_key).await;
            if let Some(instance_key) = instance_key {
                let _ = self.limiter.record_success(instance_key).await;
            }
        } else {
            let category = result.error_category.unwrap_or(ErrorCategory::Unknown);
            let error_text = result.error.clone().unwrap_or_else(|| "unknown error".into());
            let error_summary = json!({
                "error": redact(&error_text),
                "error_category": category.as_str(),
                "unrecoverable_errors": result.unrecoverable_errors,
            });

            if let Err(e) = SyncRun::finish(
                &self.deps.pool,
                run.run_id,
                RunStatus::Failed,
                Some(&counts),
                result.cursor_after.as_ref(),
                Some(&error_summary),
                None,
                None,
            )
            .await
            {
                warn!(%job_id, error = %e, "run finish failed");
            }

            if let Some(instance_key) = instance_key {
                match category {
                    ErrorCategory::RateLimit => {
                        let _ = self.limiter.record_429(instance_key, None).await;
                    }
                    ErrorCategory::Timeout => {
                        let _ = self.limiter.record_timeout(instance_key).await;
                    }
                    _ => {}
                }
            }

            if category.is_soft_requeue() {
                let _ = self
                    .queue
                    .soft_requeue(job_id, worker_id, None, &error_text)
                    .await;
            } else if category == ErrorCategory::CircuitOpen {
                let _ = self
                    .queue
                    .soft_requeue(job_id, worker_id, Some(60), &error_text)
                    .await;
            } else {
                let _ = self
                    .queue
                    .fail(job_id, worker_id, &error_text, category)
                    .await;
                if let Err(e) = self.breaker.record_failure(breaker_key).await {
                    warn!(%job_id, error = %e, "breaker record_failure failed");
                }
            }
        }
    }

    /// The human-facing logbook record for a finished run.
    async fn write_logbook_item(&self, job: &SyncJob, run: &SyncRun, result: &SyncResult) {
        let title = format!(
            "{} repo {}: +{} synced, {} skipped",
            job.job_type, job.repo_id, result.synced_count, result.skipped_count
        );
        let body = json!({
            "run_id": run.run_id.to_string(),
            "counts": run.counts,
            "cursor_after": result.cursor_after,
        });

        let item_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO items (kind, title, body_json) VALUES ('scm_sync', $1, $2) RETURNING id",
        )
        .bind(&title)
        .bind(&body)
        .fetch_one(&self.deps.pool)
        .await;

        match item_id {
            Ok(item_id) => {
                if let Err(e) =
                    SyncRun::link_logbook_item(&self.deps.pool, run.run_id, item_id).await
                {
                    warn!(run_id = %run.run_id, error = %e, "logbook link failed");
                }
            }
            Err(e) => warn!(run_id = %run.run_id, error = %e, "logbook item insert failed"),
        }
    }

    async fn cursor_snapshot(&self, job: &SyncJob) -> Option<serde_json::Value> {
        let key = match job.job_type.as_str() {
            "gitlab_commits" => gitlab_cursor_key(job.repo_id),
            "svn" => svn_cursor_key(job.repo_id),
            "gitlab_mrs" => format!("gitlab_mrs_cursor:{}", job.repo_id),
            _ => return None,
        };
        kv_get(&self.deps.pool, CURSOR_NAMESPACE, &key)
            .await
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SyncWorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.lease_seconds, 300);
        assert!(config.job_types.is_none());
    }

    #[test]
    fn config_with_worker_id() {
        let config = SyncWorkerConfig::with_worker_id("w1");
        assert_eq!(config.worker_id, "w1");
    }
}
