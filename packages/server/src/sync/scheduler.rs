//! The scheduler: cursor-age driven incremental enqueue.
//!
//! A single-leader loop. Per `(repo, job_type)` it reads the cursor age
//! and the breaker state: open circuits are skipped, half-open circuits
//! get one probe job with reduced budgets, closed circuits get an
//! incremental job once the cursor is older than the threshold. The
//! pending partial unique index provides the debounce; a second enqueue
//! for the same pair lands on the existing row.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, error, info};

use super::breaker::{CircuitBreaker, CircuitState, Degradation};
use super::keys::{build_circuit_breaker_key, normalize_instance_key, BreakerScope};
use super::payload::{JobPayload, SyncMode};
use super::queue::{EnqueueOutcome, SyncQueue};
use crate::store::{Repo, RepoType};
use crate::sync::cursor::{gitlab_cursor_key, svn_cursor_key, CURSOR_NAMESPACE};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Enqueue incremental work once the cursor is older than this.
    pub cursor_max_age_seconds: i64,
    pub probe_budget: i64,
    pub project_key: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            cursor_max_age_seconds: 900,
            probe_budget: 10,
            project_key: "default".to_string(),
        }
    }
}

/// Job types a repo of the given type supports.
pub fn job_types_for(repo_type: RepoType) -> &'static [&'static str] {
    match repo_type {
        RepoType::Gitlab => &["gitlab_commits", "gitlab_mrs"],
        RepoType::Git => &["gitlab_commits"],
        RepoType::Svn => &["svn"],
    }
}

#[derive(Debug, Default)]
pub struct ScheduleTickReport {
    pub considered: usize,
    pub enqueued: usize,
    pub probes: usize,
    pub skipped_open: usize,
    pub debounced: usize,
}

pub struct Scheduler {
    pool: PgPool,
    queue: SyncQueue,
    breaker: CircuitBreaker,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        queue: SyncQueue,
        breaker: CircuitBreaker,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            breaker,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "scheduler starting"
        );

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match self.tick().await {
                Ok(report) if report.enqueued + report.probes > 0 => {
                    info!(
                        enqueued = report.enqueued,
                        probes = report.probes,
                        skipped_open = report.skipped_open,
                        "scheduler tick enqueued work"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }

            tokio::time::sleep(self.config.interval).await;
        }

        info!("scheduler stopped");
        Ok(())
    }

    /// One pass over every active repo and its supported job types.
    pub async fn tick(&self) -> Result<ScheduleTickReport> {
        let mut report = ScheduleTickReport::default();
        let repos = Repo::list(&self.pool, None, 10_000).await?;

        for repo in &repos {
            for job_type in job_types_for(repo.repo_type) {
                report.considered += 1;
                self.consider(repo, job_type, &mut report).await?;
            }
        }
        Ok(report)
    }

    async fn consider(
        &self,
        repo: &Repo,
        job_type: &str,
        report: &mut ScheduleTickReport,
    ) -> Result<()> {
        let project_key = repo
            .project_key
            .clone()
            .unwrap_or_else(|| self.config.project_key.clone());
        let instance_key = normalize_instance_key(&repo.url);
        let scope = instance_key
            .clone()
            .map(BreakerScope::Instance)
            .unwrap_or(BreakerScope::Global);
        let breaker_key = build_circuit_breaker_key(&project_key, &scope);

        let snapshot = self.breaker.snapshot(&breaker_key).await?;
        match snapshot.state {
            CircuitState::Open => {
                report.skipped_open += 1;
                return Ok(());
            }
            CircuitState::HalfOpen => {
                let payload = self.probe_payload(repo, instance_key.as_deref());
                match self
                    .queue
                    .enqueue(
                        repo.repo_id,
                        job_type,
                        SyncMode::Probe,
                        &payload.to_value(),
                        Some(50),
                        None,
                    )
                    .await
                {
                    Ok(EnqueueOutcome::Created(_)) => report.probes += 1,
                    Ok(EnqueueOutcome::Debounced(_)) => report.debounced += 1,
                    Err(e) => error!(repo_id = repo.repo_id, job_type, error = %e, "probe enqueue failed"),
                }
                return Ok(());
            }
            CircuitState::Closed => {}
        }

        if !self.cursor_is_stale(repo, job_type).await? {
            return Ok(());
        }

        let mut payload = JobPayload::v2();
        payload.mode = Some(SyncMode::Incremental);
        payload.update_watermark = Some(true);
        payload.gitlab_instance = instance_key;
        payload.tenant_id =
            super::keys::extract_tenant_id(None, Some(project_key.as_str()));

        match self
            .queue
            .enqueue(
                repo.repo_id,
                job_type,
                SyncMode::Incremental,
                &payload.to_value(),
                None,
                None,
            )
            .await
        {
            Ok(EnqueueOutcome::Created(job_id)) => {
                debug!(repo_id = repo.repo_id, job_type, %job_id, "incremental job enqueued");
                report.enqueued += 1;
            }
            Ok(EnqueueOutcome::Debounced(_)) => report.debounced += 1,
            Err(e) => error!(repo_id = repo.repo_id, job_type, error = %e, "enqueue failed"),
        }
        Ok(())
    }

    /// A probe payload embeds the breaker's suggested degradations.
    fn probe_payload(&self, _repo: &Repo, instance_key: Option<&str>) -> JobPayload {
        let hints = Degradation::default();
        let mut payload = JobPayload::v2();
        payload.mode = Some(SyncMode::Probe);
        payload.diff_mode = None;
        payload.update_watermark = Some(false);
        payload.gitlab_instance = instance_key.map(str::to_string);
        payload.probe_budget = Some(self.config.probe_budget);
        payload.is_backfill_only = Some(true);
        payload.circuit_state = Some(CircuitState::HalfOpen.as_str().to_string());
        payload.suggested_batch_size = Some(hints.suggested_batch_size);
        payload.suggested_forward_window_seconds = Some(hints.suggested_forward_window_seconds);
        payload.suggested_diff_mode = Some(super::payload::DiffMode::None);
        payload
    }

    /// Whether the incremental cursor is old enough to warrant work. A
    /// repo with no cursor at all is always due.
    async fn cursor_is_stale(&self, repo: &Repo, job_type: &str) -> Result<bool> {
        let key = match job_type {
            "gitlab_commits" => gitlab_cursor_key(repo.repo_id),
            "svn" => svn_cursor_key(repo.repo_id),
            "gitlab_mrs" => format!("gitlab_mrs_cursor:{}", repo.repo_id),
            _ => return Ok(false),
        };

        let entry = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT updated_at FROM kv WHERE namespace = $1 AND key = $2",
        )
        .bind(CURSOR_NAMESPACE)
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        match entry {
            None => Ok(true),
            Some(updated_at) => {
                let age = (Utc::now() - updated_at).num_seconds();
                Ok(age >= self.config.cursor_max_age_seconds)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_types_match_repo_types() {
        assert_eq!(job_types_for(RepoType::Gitlab), ["gitlab_commits", "gitlab_mrs"]);
        assert_eq!(job_types_for(RepoType::Svn), ["svn"]);
        assert_eq!(job_types_for(RepoType::Git), ["gitlab_commits"]);
    }
}
