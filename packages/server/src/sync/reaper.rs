//! The reaper: lost-lease recovery and audit backfill.
//!
//! A single-leader loop that (1) moves expired running jobs back to
//! `pending` and emits `outbox_stale` audits for any outbox the job was
//! carrying, and (2) scans `outbox_memory` against `write_audit` for
//! missing flush audits and back-fills them. Every operation is
//! idempotent: a second sweep over the same data reports zero fixes.
//! Report mode (`auto_fix = false`) only counts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use super::audit;
use super::queue::SyncQueue;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Added to `lease_seconds` before a running job counts as stale.
    pub stale_grace_seconds: i64,
    /// Report mode counts without writing when false.
    pub auto_fix: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            stale_grace_seconds: 30,
            auto_fix: true,
        }
    }
}

/// One sweep's findings.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReapReport {
    pub stale_jobs: usize,
    pub stale_audits_emitted: usize,
    pub sent_missing_audit: usize,
    pub sent_audits_backfilled: usize,
    pub dead_missing_audit: usize,
    pub dead_audits_backfilled: usize,
}

impl ReapReport {
    pub fn changed(&self) -> usize {
        self.stale_jobs
            + self.stale_audits_emitted
            + self.sent_audits_backfilled
            + self.dead_audits_backfilled
    }
}

pub struct Reaper {
    pool: PgPool,
    queue: SyncQueue,
    config: ReaperConfig,
    shutdown: Arc<AtomicBool>,
}

impl Reaper {
    pub fn new(pool: PgPool, queue: SyncQueue, config: ReaperConfig) -> Self {
        Self {
            pool,
            queue,
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
            auto_fix = self.config.auto_fix,
            "reaper starting"
        );

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match self.sweep().await {
                Ok(report) if report.changed() > 0 => {
                    info!(
                        stale_jobs = report.stale_jobs,
                        sent_backfilled = report.sent_audits_backfilled,
                        dead_backfilled = report.dead_audits_backfilled,
                        "reaper sweep applied fixes"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "reaper sweep failed"),
            }

            tokio::time::sleep(self.config.interval).await;
        }

        info!("reaper stopped");
        Ok(())
    }

    /// One full sweep: stale leases first, then audit reconciliation.
    pub async fn sweep(&self) -> Result<ReapReport> {
        let mut report = ReapReport::default();

        if self.config.auto_fix {
            let reaped = self.queue.reap_expired(self.config.stale_grace_seconds).await?;
            report.stale_jobs = reaped.len();

            for job in &reaped {
                // Jobs carrying an outbox reference get a stale audit so the
                // flush pipeline can see the interruption.
                if let Some(outbox_id) = job
                    .payload_json
                    .get("outbox_id")
                    .and_then(|v| v.as_str())
                    .and_then(|raw| Uuid::parse_str(raw).ok())
                {
                    if audit::emit_stale_audit(&self.pool, outbox_id, job.last_error.as_deref())
                        .await?
                    {
                        report.stale_audits_emitted += 1;
                    }
                }
            }
        } else {
            report.stale_jobs = self.count_stale().await?;
        }

        let sent_missing = audit::sent_outboxes_missing_audit(&self.pool).await?;
        report.sent_missing_audit = sent_missing.len();
        if self.config.auto_fix {
            for outbox in &sent_missing {
                if audit::backfill_sent_audit(&self.pool, outbox).await? {
                    report.sent_audits_backfilled += 1;
                }
            }
        }

        let dead_missing = audit::dead_outboxes_missing_audit(&self.pool).await?;
        report.dead_missing_audit = dead_missing.len();
        if self.config.auto_fix {
            for outbox in &dead_missing {
                if audit::backfill_dead_audit(&self.pool, outbox).await? {
                    report.dead_audits_backfilled += 1;
                }
            }
        }

        Ok(report)
    }

    async fn count_stale(&self) -> Result<usize> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM sync_jobs
            WHERE status = 'running'
              AND locked_at + make_interval(secs => (lease_seconds + $1)::float8) < now()
            "#,
        )
        .bind(self.config.stale_grace_seconds as f64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_changes() {
        let mut report = ReapReport::default();
        assert_eq!(report.changed(), 0);
        report.stale_jobs = 2;
        report.sent_audits_backfilled = 1;
        assert_eq!(report.changed(), 3);
    }

    #[test]
    fn default_config_is_active_mode() {
        let config = ReaperConfig::default();
        assert!(config.auto_fix);
        assert_eq!(config.stale_grace_seconds, 30);
    }
}
