//! Durable sync-run records.
//!
//! A run is owned by the worker that started it and transitions
//! `running → completed|failed` exactly once; the finish update is guarded
//! on the current status so a lost-lease worker cannot double-finish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::sync::payload::SyncMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub repo_id: i64,
    pub job_type: String,
    pub mode: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cursor_before: Option<Value>,
    pub cursor_after: Option<Value>,
    pub counts: Option<Value>,
    pub error_summary_json: Option<Value>,
    pub degradation_json: Option<Value>,
    pub evidence_refs_json: Option<Value>,
    pub logbook_item_id: Option<i64>,
}

const RUN_COLUMNS: &str = "run_id, repo_id, job_type, mode, status, started_at, finished_at, \
     cursor_before, cursor_after, counts, error_summary_json, degradation_json, \
     evidence_refs_json, logbook_item_id";

impl SyncRun {
    pub async fn insert_start(
        pool: &PgPool,
        repo_id: i64,
        job_type: &str,
        mode: SyncMode,
        cursor_before: Option<&Value>,
    ) -> StoreResult<SyncRun> {
        let run = sqlx::query_as::<_, SyncRun>(&format!(
            r#"
            INSERT INTO sync_runs (run_id, repo_id, job_type, mode, status, cursor_before)
            VALUES ($1, $2, $3, $4, 'running', $5)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(repo_id)
        .bind(job_type)
        .bind(mode.as_str())
        .bind(cursor_before)
        .fetch_one(pool)
        .await?;
        Ok(run)
    }

    /// Finish a run. Fails with [`StoreError::InvalidTransition`] when the
    /// run is not currently `running` (status transitions are monotonic).
    #[allow(clippy::too_many_arguments)]
    pub async fn finish(
        pool: &PgPool,
        run_id: Uuid,
        status: RunStatus,
        counts: Option<&Value>,
        cursor_after: Option<&Value>,
        error_summary: Option<&Value>,
        degradation: Option<&Value>,
        evidence_refs: Option<&Value>,
    ) -> StoreResult<SyncRun> {
        if status == RunStatus::Running {
            return Err(StoreError::InvalidTransition(
                "cannot finish a run back into running".to_string(),
            ));
        }

        let run = sqlx::query_as::<_, SyncRun>(&format!(
            r#"
            UPDATE sync_runs
            SET status = $2,
                finished_at = now(),
                counts = $3,
                cursor_after = $4,
                error_summary_json = $5,
                degradation_json = $6,
                evidence_refs_json = COALESCE($7, evidence_refs_json)
            WHERE run_id = $1 AND status = 'running'
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(status)
        .bind(counts)
        .bind(cursor_after)
        .bind(error_summary)
        .bind(degradation)
        .bind(evidence_refs)
        .fetch_optional(pool)
        .await?;

        run.ok_or_else(|| {
            StoreError::InvalidTransition(format!("run {run_id} is not running"))
        })
    }

    /// Attach the human-facing logbook record.
    pub async fn link_logbook_item(
        pool: &PgPool,
        run_id: Uuid,
        logbook_item_id: i64,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE sync_runs SET logbook_item_id = $2 WHERE run_id = $1")
            .bind(run_id)
            .bind(logbook_item_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &PgPool, run_id: Uuid) -> StoreResult<SyncRun> {
        let run = sqlx::query_as::<_, SyncRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
        run.ok_or_else(|| StoreError::NotFound(format!("sync_run {run_id}")))
    }

    pub async fn list(
        pool: &PgPool,
        repo_id: Option<i64>,
        limit: i64,
    ) -> StoreResult<Vec<SyncRun>> {
        let runs = sqlx::query_as::<_, SyncRun>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM sync_runs
            WHERE ($1::bigint IS NULL OR repo_id = $1)
            ORDER BY started_at DESC
            LIMIT $2
            "#
        ))
        .bind(repo_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(runs)
    }
}
