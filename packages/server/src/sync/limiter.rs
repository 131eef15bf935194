//! Per-instance token-bucket rate limiting, persisted in Postgres.
//!
//! One bucket per normalized instance key. Tokens refill lazily at read
//! time; every mutation runs under `SELECT … FOR UPDATE` on the bucket
//! row so concurrent workers on different machines stay consistent. A
//! 429 or timeout from the SCM pauses the whole bucket and tags
//! `meta_json.pause_source`; successes shorten the pause.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};

use crate::store::{StoreError, StoreResult};

/// Pause applied on a 429 without a Retry-After hint.
const DEFAULT_429_PAUSE_SECONDS: i64 = 60;
/// Pause applied on a timeout signal.
const TIMEOUT_PAUSE_SECONDS: i64 = 30;
/// Timeout-sourced pauses clear after this many consecutive successes.
const TIMEOUT_CLEAR_SUCCESSES: i64 = 2;

#[derive(Debug, Clone, FromRow)]
struct BucketRow {
    tokens: f64,
    rate: f64,
    burst: f64,
    paused_until: Option<DateTime<Utc>>,
    meta_json: Value,
    updated_at: DateTime<Utc>,
}

/// Outcome of a non-blocking acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquireOutcome {
    Acquired,
    /// Not acquired; retry after roughly this many seconds.
    Wait(f64),
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    pool: PgPool,
    default_rate: f64,
    default_burst: f64,
}

impl RateLimiter {
    pub fn new(pool: PgPool, default_rate: f64, default_burst: f64) -> Self {
        Self {
            pool,
            default_rate,
            default_burst,
        }
    }

    /// Try to take one token without blocking.
    pub async fn try_acquire(&self, instance_key: &str) -> StoreResult<AcquireOutcome> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let row = self.lock_or_create(&mut tx, instance_key, now).await?;

        if let Some(paused_until) = row.paused_until {
            if paused_until > now {
                tx.commit().await?;
                let wait = (paused_until - now).num_milliseconds().max(0) as f64 / 1000.0;
                return Ok(AcquireOutcome::Wait(wait));
            }
        }

        let elapsed = (now - row.updated_at).num_milliseconds().max(0) as f64 / 1000.0;
        let tokens = (row.tokens + row.rate * elapsed).min(row.burst);

        if tokens >= 1.0 {
            sqlx::query(
                r#"
                UPDATE rate_limit_buckets
                SET tokens = $2, paused_until = NULL, updated_at = $3
                WHERE instance_key = $1
                "#,
            )
            .bind(instance_key)
            .bind(tokens - 1.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(AcquireOutcome::Acquired)
        } else {
            sqlx::query(
                "UPDATE rate_limit_buckets SET tokens = $2, updated_at = $3 WHERE instance_key = $1",
            )
            .bind(instance_key)
            .bind(tokens)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            let wait = if row.rate > 0.0 {
                (1.0 - tokens) / row.rate
            } else {
                1.0
            };
            Ok(AcquireOutcome::Wait(wait))
        }
    }

    /// Blocking acquire: waits up to `wait_max`, returning `false` (and the
    /// remaining wait hint) when the budget does not open in time.
    pub async fn acquire(
        &self,
        instance_key: &str,
        wait_max: Duration,
    ) -> StoreResult<(bool, f64)> {
        let started = std::time::Instant::now();
        loop {
            match self.try_acquire(instance_key).await? {
                AcquireOutcome::Acquired => return Ok((true, 0.0)),
                AcquireOutcome::Wait(wait_seconds) => {
                    let elapsed = started.elapsed();
                    let wanted = Duration::from_secs_f64(wait_seconds.max(0.05));
                    if elapsed + wanted > wait_max {
                        return Ok((false, wait_seconds));
                    }
                    tokio::time::sleep(wanted.min(Duration::from_secs(5))).await;
                }
            }
        }
    }

    /// A 429 from the SCM: pause the bucket until the hint (or default)
    /// elapses.
    pub async fn record_429(
        &self,
        instance_key: &str,
        retry_after_seconds: Option<u64>,
    ) -> StoreResult<()> {
        let pause = retry_after_seconds
            .map(|s| s as i64)
            .unwrap_or(DEFAULT_429_PAUSE_SECONDS);
        self.pause_bucket(instance_key, pause, "429").await
    }

    /// A timeout talking to the SCM: shorter pause, separate source tag.
    pub async fn record_timeout(&self, instance_key: &str) -> StoreResult<()> {
        self.pause_bucket(instance_key, TIMEOUT_PAUSE_SECONDS, "timeout")
            .await
    }

    /// A success may shorten an active pause: 429-sourced pauses halve
    /// their remainder per success, timeout-sourced pauses clear entirely
    /// after two consecutive successes.
    pub async fn record_success(&self, instance_key: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let row = self.lock_or_create(&mut tx, instance_key, now).await?;

        let Some(paused_until) = row.paused_until.filter(|until| *until > now) else {
            // No active pause: reset the success streak tag if present.
            if row.meta_json.get("consecutive_successes").is_some() {
                let mut meta = row.meta_json.clone();
                meta["consecutive_successes"] = json!(0);
                sqlx::query(
                    "UPDATE rate_limit_buckets SET meta_json = $2, paused_until = NULL WHERE instance_key = $1",
                )
                .bind(instance_key)
                .bind(&meta)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            return Ok(());
        };

        let source = row.meta_json["pause_source"].as_str().unwrap_or("").to_string();
        let mut meta = if row.meta_json.is_object() {
            row.meta_json.clone()
        } else {
            json!({})
        };
        let source = source.as_str();
        let new_until: Option<DateTime<Utc>> = match source {
            "timeout" => {
                let streak = meta["consecutive_successes"].as_i64().unwrap_or(0) + 1;
                meta["consecutive_successes"] = json!(streak);
                if streak >= TIMEOUT_CLEAR_SUCCESSES {
                    meta["consecutive_successes"] = json!(0);
                    None
                } else {
                    Some(paused_until)
                }
            }
            _ => {
                // Halve the remaining pause, floor zero.
                let remaining_ms = (paused_until - now).num_milliseconds().max(0);
                if remaining_ms < 1000 {
                    None
                } else {
                    Some(now + chrono::Duration::milliseconds(remaining_ms / 2))
                }
            }
        };

        debug!(
            instance_key,
            pause_source = source,
            shortened_to = ?new_until,
            "success while paused"
        );

        sqlx::query(
            "UPDATE rate_limit_buckets SET paused_until = $2, meta_json = $3 WHERE instance_key = $1",
        )
        .bind(instance_key)
        .bind(new_until)
        .bind(&meta)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Current pause remaining, for metrics.
    pub async fn pause_remaining(&self, instance_key: &str) -> StoreResult<f64> {
        let paused_until = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT paused_until FROM rate_limit_buckets WHERE instance_key = $1",
        )
        .bind(instance_key)
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(paused_until
            .map(|until| (until - Utc::now()).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0))
    }

    async fn pause_bucket(
        &self,
        instance_key: &str,
        pause_seconds: i64,
        source: &str,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let row = self.lock_or_create(&mut tx, instance_key, now).await?;

        let paused_until = now + chrono::Duration::seconds(pause_seconds);
        let mut meta = if row.meta_json.is_object() {
            row.meta_json
        } else {
            json!({})
        };
        meta["pause_source"] = json!(source);
        meta["consecutive_successes"] = json!(0);

        sqlx::query(
            "UPDATE rate_limit_buckets SET paused_until = $2, meta_json = $3 WHERE instance_key = $1",
        )
        .bind(instance_key)
        .bind(paused_until)
        .bind(&meta)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(instance_key, pause_seconds, source, "rate limit bucket paused");
        Ok(())
    }

    /// Lock the bucket row, creating it with defaults on first touch.
    async fn lock_or_create(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        instance_key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<BucketRow> {
        let existing = sqlx::query_as::<_, BucketRow>(
            r#"
            SELECT tokens, rate, burst, paused_until, meta_json, updated_at
            FROM rate_limit_buckets
            WHERE instance_key = $1
            FOR UPDATE
            "#,
        )
        .bind(instance_key)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = existing {
            return Ok(row);
        }

        sqlx::query(
            r#"
            INSERT INTO rate_limit_buckets (instance_key, tokens, rate, burst, meta_json, updated_at)
            VALUES ($1, $2, $3, $4, '{}'::jsonb, $5)
            ON CONFLICT (instance_key) DO NOTHING
            "#,
        )
        .bind(instance_key)
        .bind(self.default_burst)
        .bind(self.default_rate)
        .bind(self.default_burst)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query_as::<_, BucketRow>(
            r#"
            SELECT tokens, rate, burst, paused_until, meta_json, updated_at
            FROM rate_limit_buckets
            WHERE instance_key = $1
            FOR UPDATE
            "#,
        )
        .bind(instance_key)
        .fetch_optional(&mut **tx)
        .await?;

        row.ok_or_else(|| {
            StoreError::NotFound(format!("rate limit bucket {instance_key}"))
        })
    }
}
