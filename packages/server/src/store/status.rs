//! Aggregated sync status for the metrics and CLI surfaces.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};

use super::kv::{kv_list, NAMESPACE_SYNC_HEALTH, NAMESPACE_SYNC_PAUSES};
use super::StoreResult;

/// Error-budget window.
const BUDGET_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub repos_total: i64,
    pub repos_by_type: Vec<LabelCount>,
    pub jobs_by_status: Vec<LabelCount>,
    pub error_budget: ErrorBudget,
    pub breakers: Vec<BreakerStatus>,
    pub buckets: Vec<BucketStatus>,
    pub pauses_by_reason: Vec<LabelCount>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LabelCount {
    pub label: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ErrorBudget {
    pub window_hours: i64,
    pub total_runs: i64,
    pub failure_count: i64,
    pub rate_429_count: i64,
    pub timeout_count: i64,
    pub failure_rate: f64,
    pub rate_429_rate: f64,
    pub timeout_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub key: String,
    pub state: String,
    pub failure_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub instance_key: String,
    pub tokens: f64,
    pub rate: f64,
    pub burst: f64,
    pub paused: bool,
    pub pause_seconds_remaining: f64,
}

#[derive(Debug, FromRow)]
struct BucketRow {
    instance_key: String,
    tokens: f64,
    rate: f64,
    burst: f64,
    paused_until: Option<DateTime<Utc>>,
}

pub async fn get_sync_status_summary(pool: &PgPool) -> StoreResult<StatusSummary> {
    let repos_total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM repos")
        .fetch_one(pool)
        .await?;

    let repos_by_type = sqlx::query_as::<_, LabelCount>(
        "SELECT repo_type AS label, COUNT(*) AS count FROM repos GROUP BY repo_type ORDER BY repo_type",
    )
    .fetch_all(pool)
    .await?;

    let jobs_by_status = sqlx::query_as::<_, LabelCount>(
        "SELECT status AS label, COUNT(*) AS count FROM sync_jobs GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await?;

    let error_budget = load_error_budget(pool).await?;

    let mut breakers = Vec::new();
    for entry in kv_list(pool, NAMESPACE_SYNC_HEALTH).await? {
        let state = entry.value_json["state"]
            .as_str()
            .unwrap_or("closed")
            .to_string();
        let failure_count = entry.value_json["failure_count"].as_i64().unwrap_or(0);
        breakers.push(BreakerStatus {
            key: entry.key,
            state,
            failure_count,
        });
    }

    let now = Utc::now();
    let bucket_rows = sqlx::query_as::<_, BucketRow>(
        "SELECT instance_key, tokens, rate, burst, paused_until FROM rate_limit_buckets ORDER BY instance_key",
    )
    .fetch_all(pool)
    .await?;
    let buckets = bucket_rows
        .into_iter()
        .map(|row| {
            let pause_seconds_remaining = row
                .paused_until
                .map(|until| (until - now).num_milliseconds().max(0) as f64 / 1000.0)
                .unwrap_or(0.0);
            BucketStatus {
                instance_key: row.instance_key,
                tokens: row.tokens,
                rate: row.rate,
                burst: row.burst,
                paused: pause_seconds_remaining > 0.0,
                pause_seconds_remaining,
            }
        })
        .collect();

    let mut pauses_by_reason: std::collections::BTreeMap<String, i64> = Default::default();
    for entry in kv_list(pool, NAMESPACE_SYNC_PAUSES).await? {
        let reason = entry.value_json["reason_code"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        *pauses_by_reason.entry(reason).or_insert(0) += 1;
    }
    let pauses_by_reason = pauses_by_reason
        .into_iter()
        .map(|(label, count)| LabelCount { label, count })
        .collect();

    Ok(StatusSummary {
        repos_total,
        repos_by_type,
        jobs_by_status,
        error_budget,
        breakers,
        buckets,
        pauses_by_reason,
    })
}

async fn load_error_budget(pool: &PgPool) -> StoreResult<ErrorBudget> {
    #[derive(FromRow)]
    struct BudgetRow {
        total_runs: i64,
        failure_count: i64,
        rate_429_count: i64,
        timeout_count: i64,
    }

    let row = sqlx::query_as::<_, BudgetRow>(
        r#"
        SELECT
            COUNT(*) AS total_runs,
            COUNT(*) FILTER (WHERE status = 'failed') AS failure_count,
            COALESCE(SUM((counts->>'total_429_hits')::bigint), 0) AS rate_429_count,
            COALESCE(SUM((counts->>'timeout_count')::bigint), 0) AS timeout_count
        FROM sync_runs
        WHERE started_at > now() - make_interval(hours => $1::int)
        "#,
    )
    .bind(BUDGET_WINDOW_HOURS as i32)
    .fetch_one(pool)
    .await?;

    let rate = |count: i64| {
        if row.total_runs == 0 {
            0.0
        } else {
            count as f64 / row.total_runs as f64
        }
    };

    Ok(ErrorBudget {
        window_hours: BUDGET_WINDOW_HOURS,
        total_runs: row.total_runs,
        failure_count: row.failure_count,
        rate_429_count: row.rate_429_count,
        timeout_count: row.timeout_count,
        failure_rate: rate(row.failure_count),
        rate_429_rate: rate(row.rate_429_count),
        timeout_rate: rate(row.timeout_count),
    })
}
