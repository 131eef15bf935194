//! The durable sync-job queue.
//!
//! Claiming uses a `FOR UPDATE SKIP LOCKED` CTE so concurrent workers
//! never share a lease; ordering is `(priority, created_at)` modulo those
//! races. A claim also touches the advisory `sync_locks` row for the
//! job's `(repo_id, job_type)`. Completion and failure are guarded on
//! `locked_by`, so a worker that lost its lease cannot commit anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::keys::normalize_instance_key;
use super::payload::{validate_job_payload, JobPayload, PayloadValidationError, SyncMode};
use super::result::ErrorCategory;
use crate::common::redact::redact;
use crate::store::StoreError;

/// Delay applied on a lock-held soft re-queue.
const LOCK_RETRY_DELAY_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SyncJob {
    pub job_id: Uuid,
    pub repo_id: i64,
    pub job_type: String,
    pub mode: String,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub not_before: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_seconds: i32,
    pub last_error: Option<String>,
    pub last_run_id: Option<Uuid>,
    pub payload_json: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    /// Lenient typed view of the payload; schema validation happened at
    /// enqueue time.
    pub fn payload(&self) -> JobPayload {
        serde_json::from_value(self.payload_json.clone()).unwrap_or_default()
    }

    pub fn mode_enum(&self) -> SyncMode {
        match self.mode.as_str() {
            "backfill" => SyncMode::Backfill,
            "probe" => SyncMode::Probe,
            _ => SyncMode::Incremental,
        }
    }
}

/// Advisory lock row plus derived state, for the status surface.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SyncLockRow {
    pub repo_id: i64,
    pub job_type: String,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_seconds: i32,
    pub is_locked: bool,
    pub is_expired: bool,
}

#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Created(Uuid),
    /// A pending job for this `(repo_id, job_type)` already exists.
    Debounced(Uuid),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Debounced(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

#[derive(Debug)]
pub enum FailOutcome {
    /// Requeued with backoff.
    Retrying { not_before: DateTime<Utc> },
    /// Non-retryable or out of attempts.
    Dead,
    /// The caller no longer holds the lease; nothing was written.
    LeaseLost,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Payload(#[from] PayloadValidationError),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Store(StoreError::Database(e))
    }
}

const JOB_COLUMNS: &str = "job_id, repo_id, job_type, mode, priority, status, attempts, \
     max_attempts, not_before, locked_by, locked_at, lease_seconds, last_error, last_run_id, \
     payload_json, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SyncQueue {
    pool: PgPool,
    retry_base_seconds: i64,
    retry_max_seconds: i64,
    default_lease_seconds: i32,
}

impl SyncQueue {
    pub fn new(
        pool: PgPool,
        retry_base_seconds: i64,
        retry_max_seconds: i64,
        default_lease_seconds: i32,
    ) -> Self {
        Self {
            pool,
            retry_base_seconds,
            retry_max_seconds,
            default_lease_seconds,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert one job. The payload must validate against the v2 schema;
    /// its `gitlab_instance` is normalized before storage so claim-time
    /// allowlist matching is a plain string equality.
    pub async fn enqueue(
        &self,
        repo_id: i64,
        job_type: &str,
        mode: SyncMode,
        payload: &Value,
        priority: Option<i32>,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome, QueueError> {
        validate_job_payload(payload)?;

        let mut payload = payload.clone();
        if let Some(instance) = payload.get("gitlab_instance").and_then(Value::as_str) {
            match normalize_instance_key(instance) {
                Some(normalized) => {
                    payload["gitlab_instance"] = Value::String(normalized);
                }
                None => {
                    if let Some(map) = payload.as_object_mut() {
                        map.remove("gitlab_instance");
                    }
                }
            }
        }

        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO sync_jobs (
                job_id, repo_id, job_type, mode, priority, not_before,
                lease_seconds, payload_json
            )
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, now()), $7, $8)
            ON CONFLICT (repo_id, job_type) WHERE status = 'pending' DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(repo_id)
        .bind(job_type)
        .bind(mode.as_str())
        .bind(priority.unwrap_or(100))
        .bind(not_before)
        .bind(self.default_lease_seconds)
        .bind(&payload)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job_id) = inserted {
            debug!(%job_id, repo_id, job_type, "job enqueued");
            return Ok(EnqueueOutcome::Created(job_id));
        }

        let existing = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT job_id FROM sync_jobs
            WHERE repo_id = $1 AND job_type = $2 AND status = 'pending'
            LIMIT 1
            "#,
        )
        .bind(repo_id)
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(job_id) => Ok(EnqueueOutcome::Debounced(job_id)),
            // The pending twin completed between the insert and the probe;
            // one retry will land.
            None => Err(QueueError::Store(StoreError::NotFound(format!(
                "pending sync_job for repo {repo_id} {job_type}"
            )))),
        }
    }

    /// Claim the next eligible job for this worker, respecting an optional
    /// job-type filter and instance allowlist. Allowlist values are
    /// normalized with the same function used at enqueue time.
    pub async fn claim_one(
        &self,
        worker_id: &str,
        job_types: Option<&[String]>,
        instance_allowlist: Option<&[String]>,
        lease_seconds: i32,
    ) -> Result<Option<SyncJob>, QueueError> {
        let allowlist: Option<Vec<String>> = instance_allowlist.map(|items| {
            items
                .iter()
                .filter_map(|raw| normalize_instance_key(raw))
                .collect()
        });

        let job = sqlx::query_as::<_, SyncJob>(&format!(
            r#"
            WITH next_job AS (
                SELECT job_id
                FROM sync_jobs
                WHERE status = 'pending'
                  AND not_before <= now()
                  AND attempts < max_attempts
                  AND ($2::text[] IS NULL OR job_type = ANY($2))
                  AND ($3::text[] IS NULL OR payload_json->>'gitlab_instance' = ANY($3))
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE sync_jobs
            SET status = 'running',
                locked_by = $1,
                locked_at = now(),
                lease_seconds = $4,
                attempts = attempts + 1,
                updated_at = now()
            WHERE job_id IN (SELECT job_id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(job_types)
        .bind(allowlist.as_deref())
        .bind(lease_seconds)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            self.touch_sync_lock(job, worker_id).await?;
            debug!(job_id = %job.job_id, worker_id, "job claimed");
        }
        Ok(job)
    }

    /// Refresh the lease. `false` means the lease is lost: the caller must
    /// abort and discard any uncommitted work.
    pub async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET locked_at = now(), updated_at = now()
            WHERE job_id = $1 AND locked_by = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE sync_locks
            SET locked_at = now()
            WHERE locked_by = $1
              AND (repo_id, job_type) = (SELECT repo_id, job_type FROM sync_jobs WHERE job_id = $2)
            "#,
        )
        .bind(worker_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    /// Mark the job completed and link its run record. Returns `false`
    /// when the lease was lost.
    pub async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<bool, QueueError> {
        let job = sqlx::query_as::<_, SyncJob>(&format!(
            r#"
            UPDATE sync_jobs
            SET status = 'completed',
                locked_by = NULL,
                locked_at = NULL,
                last_run_id = COALESCE($3, last_run_id),
                updated_at = now()
            WHERE job_id = $1 AND locked_by = $2 AND status = 'running'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => {
                self.release_sync_lock(&job, worker_id).await?;
                info!(job_id = %job_id, "job completed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record a failure. Retryable categories requeue with exponential,
    /// jittered backoff; non-retryable categories and exhausted attempts
    /// go to `dead`.
    pub async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        category: ErrorCategory,
    ) -> Result<FailOutcome, QueueError> {
        let error = redact(error);

        let current = sqlx::query_as::<_, SyncJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE job_id = $1 AND locked_by = $2 AND status = 'running'"
        ))
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(current) = current else {
            return Ok(FailOutcome::LeaseLost);
        };

        let dead = category.is_non_retryable() || current.attempts >= current.max_attempts;

        if dead {
            let result = sqlx::query(
                r#"
                UPDATE sync_jobs
                SET status = 'dead',
                    locked_by = NULL,
                    locked_at = NULL,
                    last_error = $3,
                    updated_at = now()
                WHERE job_id = $1 AND locked_by = $2 AND status = 'running'
                "#,
            )
            .bind(job_id)
            .bind(worker_id)
            .bind(format!("{}: {}", category.as_str(), error))
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Ok(FailOutcome::LeaseLost);
            }
            self.release_sync_lock(&current, worker_id).await?;
            warn!(job_id = %job_id, category = %category, "job dead");
            Ok(FailOutcome::Dead)
        } else {
            let backoff = self.backoff_seconds(current.attempts);
            let not_before = Utc::now() + chrono::Duration::seconds(backoff);
            let result = sqlx::query(
                r#"
                UPDATE sync_jobs
                SET status = 'pending',
                    locked_by = NULL,
                    locked_at = NULL,
                    not_before = $3,
                    last_error = $4,
                    updated_at = now()
                WHERE job_id = $1 AND locked_by = $2 AND status = 'running'
                "#,
            )
            .bind(job_id)
            .bind(worker_id)
            .bind(not_before)
            .bind(format!("{}: {}", category.as_str(), error))
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Ok(FailOutcome::LeaseLost);
            }
            self.release_sync_lock(&current, worker_id).await?;
            warn!(
                job_id = %job_id,
                category = %category,
                backoff_seconds = backoff,
                "job requeued with backoff"
            );
            Ok(FailOutcome::Retrying { not_before })
        }
    }

    /// Soft re-queue: the attempt does not count (the claim's increment is
    /// rolled back) and `not_before` is bumped by a fixed delay. Used for
    /// `lock_held` results and circuit-open rejections.
    pub async fn soft_requeue(
        &self,
        job_id: Uuid,
        worker_id: &str,
        delay_seconds: Option<i64>,
        note: &str,
    ) -> Result<bool, QueueError> {
        let delay = delay_seconds.unwrap_or(LOCK_RETRY_DELAY_SECONDS);
        let job = sqlx::query_as::<_, SyncJob>(&format!(
            r#"
            UPDATE sync_jobs
            SET status = 'pending',
                attempts = GREATEST(attempts - 1, 0),
                locked_by = NULL,
                locked_at = NULL,
                not_before = now() + make_interval(secs => $3::float8),
                last_error = $4,
                updated_at = now()
            WHERE job_id = $1 AND locked_by = $2 AND status = 'running'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(delay as f64)
        .bind(redact(note))
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => {
                self.release_sync_lock(&job, worker_id).await?;
                debug!(job_id = %job_id, delay, "job soft-requeued");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move expired running jobs back to `pending`, returning the reaped
    /// rows so the caller can emit audits. A job expires once
    /// `locked_at + lease_seconds + grace` is in the past.
    pub async fn reap_expired(&self, grace_seconds: i64) -> Result<Vec<SyncJob>, QueueError> {
        let jobs = sqlx::query_as::<_, SyncJob>(&format!(
            r#"
            UPDATE sync_jobs
            SET status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                last_error = COALESCE(last_error, 'lease expired'),
                updated_at = now()
            WHERE status = 'running'
              AND locked_at + make_interval(secs => (lease_seconds + $1)::float8) < now()
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(grace_seconds as f64)
        .fetch_all(&self.pool)
        .await?;

        for job in &jobs {
            sqlx::query(
                r#"
                UPDATE sync_locks
                SET locked_by = NULL, locked_at = NULL
                WHERE repo_id = $1 AND job_type = $2
                "#,
            )
            .bind(job.repo_id)
            .bind(&job.job_type)
            .execute(&self.pool)
            .await?;
            warn!(job_id = %job.job_id, worker = ?job.locked_by, "stale lease reaped");
        }
        Ok(jobs)
    }

    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Option<SyncJob>, QueueError> {
        let job = sqlx::query_as::<_, SyncJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<SyncJob>, QueueError> {
        let jobs = sqlx::query_as::<_, SyncJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM sync_jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str().to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Advisory lock rows with derived lock/expiry flags.
    pub async fn list_locks(&self, limit: i64) -> Result<Vec<SyncLockRow>, QueueError> {
        let locks = sqlx::query_as::<_, SyncLockRow>(
            r#"
            SELECT repo_id, job_type, locked_by, locked_at, lease_seconds,
                   locked_by IS NOT NULL AS is_locked,
                   locked_at IS NOT NULL
                       AND locked_at + make_interval(secs => lease_seconds::float8) < now()
                       AS is_expired
            FROM sync_locks
            ORDER BY repo_id, job_type
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(locks)
    }

    /// Whether a pending job already exists (scheduler debounce probe).
    pub async fn has_pending(&self, repo_id: i64, job_type: &str) -> Result<bool, QueueError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM sync_jobs
                WHERE repo_id = $1 AND job_type = $2 AND status = 'pending'
            )
            "#,
        )
        .bind(repo_id)
        .bind(job_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    fn backoff_seconds(&self, attempts: i32) -> i64 {
        let exponent = (attempts - 1).clamp(0, 20) as u32;
        let base = self
            .retry_base_seconds
            .saturating_mul(2i64.saturating_pow(exponent))
            .min(self.retry_max_seconds);
        // ±25% jitter keeps a failing fleet from thundering back together.
        let jitter = 0.75 + fastrand::f64() * 0.5;
        ((base as f64 * jitter) as i64).clamp(1, self.retry_max_seconds)
    }

    async fn touch_sync_lock(&self, job: &SyncJob, worker_id: &str) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO sync_locks (repo_id, job_type, locked_by, locked_at, lease_seconds)
            VALUES ($1, $2, $3, now(), $4)
            ON CONFLICT (repo_id, job_type) DO UPDATE
            SET locked_by = EXCLUDED.locked_by,
                locked_at = EXCLUDED.locked_at,
                lease_seconds = EXCLUDED.lease_seconds
            "#,
        )
        .bind(job.repo_id)
        .bind(&job.job_type)
        .bind(worker_id)
        .bind(job.lease_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_sync_lock(&self, job: &SyncJob, worker_id: &str) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE sync_locks
            SET locked_by = NULL, locked_at = NULL
            WHERE repo_id = $1 AND job_type = $2 AND locked_by = $3
            "#,
        )
        .bind(job.repo_id)
        .bind(&job.job_type)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_outcome_helpers() {
        let created = EnqueueOutcome::Created(Uuid::new_v4());
        assert!(created.is_created());
        let debounced = EnqueueOutcome::Debounced(Uuid::new_v4());
        assert!(!debounced.is_created());
    }

    #[test]
    fn job_status_strings_match_db_checks() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Dead,
        ] {
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
        }
    }
}
