//! Prometheus text exposition of the sync status summary.

use axum::extract::Extension;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use sqlx::FromRow;

use crate::server::app::AppState;
use crate::store::{get_sync_status_summary, StatusSummary};

/// Pending retries and the seconds until they fire, labeled by origin.
#[derive(Debug, Clone, FromRow)]
pub struct RetryBackoffRow {
    pub job_type: String,
    pub instance_key: Option<String>,
    pub tenant_id: Option<String>,
    pub backoff_seconds: f64,
}

pub async fn metrics_handler(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let summary = match get_sync_status_summary(&state.db_pool).await {
        Ok(summary) => summary,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("# metrics unavailable: {e}\n"),
            )
                .into_response()
        }
    };

    let backoffs = sqlx::query_as::<_, RetryBackoffRow>(
        r#"
        SELECT job_type,
               payload_json->>'gitlab_instance' AS instance_key,
               payload_json->>'tenant_id' AS tenant_id,
               EXTRACT(EPOCH FROM (not_before - now()))::float8 AS backoff_seconds
        FROM sync_jobs
        WHERE status = 'pending' AND not_before > now()
        "#,
    )
    .fetch_all(&state.db_pool)
    .await
    .unwrap_or_default();

    let body = format_prometheus_metrics(&summary, &backoffs);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// Render the summary as Prometheus lines. Pure so it can be tested
/// without a database.
pub fn format_prometheus_metrics(summary: &StatusSummary, backoffs: &[RetryBackoffRow]) -> String {
    let mut out = String::new();

    out.push_str("# HELP scm_repos_total Registered repositories.\n");
    out.push_str("# TYPE scm_repos_total gauge\n");
    out.push_str(&format!("scm_repos_total {}\n", summary.repos_total));

    out.push_str("# TYPE scm_repos_by_type gauge\n");
    for entry in &summary.repos_by_type {
        out.push_str(&format!(
            "scm_repos_by_type{{repo_type=\"{}\"}} {}\n",
            entry.label, entry.count
        ));
    }

    out.push_str("# TYPE scm_jobs_by_status gauge\n");
    for entry in &summary.jobs_by_status {
        out.push_str(&format!(
            "scm_jobs_by_status{{status=\"{}\"}} {}\n",
            entry.label, entry.count
        ));
    }

    let budget = &summary.error_budget;
    out.push_str("# TYPE scm_error_budget_failure_count gauge\n");
    out.push_str(&format!(
        "scm_error_budget_failure_count {}\n",
        budget.failure_count
    ));
    out.push_str(&format!(
        "scm_error_budget_failure_rate {:.6}\n",
        budget.failure_rate
    ));
    out.push_str(&format!(
        "scm_error_budget_429_count {}\n",
        budget.rate_429_count
    ));
    out.push_str(&format!(
        "scm_error_budget_429_rate {:.6}\n",
        budget.rate_429_rate
    ));
    out.push_str(&format!(
        "scm_error_budget_timeout_count {}\n",
        budget.timeout_count
    ));
    out.push_str(&format!(
        "scm_error_budget_timeout_rate {:.6}\n",
        budget.timeout_rate
    ));

    out.push_str("# HELP scm_circuit_breaker_state 0=closed 1=half_open 2=open.\n");
    out.push_str("# TYPE scm_circuit_breaker_state gauge\n");
    for breaker in &summary.breakers {
        let gauge = match breaker.state.as_str() {
            "open" => 2,
            "half_open" => 1,
            _ => 0,
        };
        out.push_str(&format!(
            "scm_circuit_breaker_state{{key=\"{}\"}} {}\n",
            breaker.key, gauge
        ));
    }

    out.push_str("# TYPE scm_rate_limit_bucket_tokens gauge\n");
    for bucket in &summary.buckets {
        out.push_str(&format!(
            "scm_rate_limit_bucket_tokens{{instance_key=\"{}\"}} {:.3}\n",
            bucket.instance_key, bucket.tokens
        ));
        out.push_str(&format!(
            "scm_rate_limit_bucket_paused{{instance_key=\"{}\"}} {}\n",
            bucket.instance_key,
            if bucket.paused { 1 } else { 0 }
        ));
        out.push_str(&format!(
            "scm_rate_limit_bucket_pause_seconds{{instance_key=\"{}\"}} {:.3}\n",
            bucket.instance_key, bucket.pause_seconds_remaining
        ));
    }

    out.push_str("# TYPE scm_retry_backoff_seconds gauge\n");
    for row in backoffs {
        out.push_str(&format!(
            "scm_retry_backoff_seconds{{instance_key=\"{}\",tenant_id=\"{}\",job_type=\"{}\"}} {:.3}\n",
            row.instance_key.as_deref().unwrap_or(""),
            row.tenant_id.as_deref().unwrap_or(""),
            row.job_type,
            row.backoff_seconds.max(0.0)
        ));
    }

    out.push_str("# TYPE scm_paused_by_reason gauge\n");
    for entry in &summary.pauses_by_reason {
        out.push_str(&format!(
            "scm_paused_by_reason{{reason_code=\"{}\"}} {}\n",
            entry.label, entry.count
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::status::{
        BreakerStatus, BucketStatus, ErrorBudget, LabelCount,
    };

    fn sample_summary() -> StatusSummary {
        StatusSummary {
            repos_total: 3,
            repos_by_type: vec![
                LabelCount {
                    label: "gitlab".into(),
                    count: 2,
                },
                LabelCount {
                    label: "svn".into(),
                    count: 1,
                },
            ],
            jobs_by_status: vec![LabelCount {
                label: "pending".into(),
                count: 4,
            }],
            error_budget: ErrorBudget {
                window_hours: 24,
                total_runs: 10,
                failure_count: 1,
                rate_429_count: 2,
                timeout_count: 0,
                failure_rate: 0.1,
                rate_429_rate: 0.2,
                timeout_rate: 0.0,
            },
            breakers: vec![BreakerStatus {
                key: "acme:instance:gitlab.example.com".into(),
                state: "open".into(),
                failure_count: 5,
            }],
            buckets: vec![BucketStatus {
                instance_key: "gitlab.example.com".into(),
                tokens: 7.5,
                rate: 2.0,
                burst: 10.0,
                paused: true,
                pause_seconds_remaining: 12.0,
            }],
            pauses_by_reason: vec![LabelCount {
                label: "429".into(),
                count: 1,
            }],
        }
    }

    #[test]
    fn renders_all_metric_families() {
        let backoffs = vec![RetryBackoffRow {
            job_type: "gitlab_commits".into(),
            instance_key: Some("gitlab.example.com".into()),
            tenant_id: Some("acme".into()),
            backoff_seconds: 42.0,
        }];
        let text = format_prometheus_metrics(&sample_summary(), &backoffs);

        assert!(text.contains("scm_repos_total 3"));
        assert!(text.contains("scm_repos_by_type{repo_type=\"gitlab\"} 2"));
        assert!(text.contains("scm_jobs_by_status{status=\"pending\"} 4"));
        assert!(text.contains("scm_error_budget_failure_count 1"));
        assert!(text.contains("scm_error_budget_429_rate 0.200000"));
        assert!(text.contains(
            "scm_circuit_breaker_state{key=\"acme:instance:gitlab.example.com\"} 2"
        ));
        assert!(text.contains(
            "scm_rate_limit_bucket_paused{instance_key=\"gitlab.example.com\"} 1"
        ));
        assert!(text.contains(
            "scm_retry_backoff_seconds{instance_key=\"gitlab.example.com\",tenant_id=\"acme\",job_type=\"gitlab_commits\"} 42.000"
        ));
        assert!(text.contains("scm_paused_by_reason{reason_code=\"429\"} 1"));
    }

    #[test]
    fn negative_backoff_clamps_to_zero() {
        let backoffs = vec![RetryBackoffRow {
            job_type: "svn".into(),
            instance_key: None,
            tenant_id: None,
            backoff_seconds: -3.0,
        }];
        let text = format_prometheus_metrics(&sample_summary(), &backoffs);
        assert!(text.contains("job_type=\"svn\"} 0.000"));
    }
}
