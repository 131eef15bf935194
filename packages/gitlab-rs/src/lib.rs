//! Minimal GitLab REST API client for SCM synchronization.
//!
//! Covers the three read surfaces the sync handlers need: repository
//! commits, merge requests, and merge-request notes. Every call feeds a
//! caller-owned [`RequestStats`] so rate-limit hits and timeouts can be
//! reported back through the sync result envelope.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use thiserror::Error;

pub mod models;

pub use models::{CommitDiff, CommitStats, MergeRequest, Note, RepoCommit, UserRef};

#[derive(Debug, Clone)]
pub struct GitLabOptions {
    /// Instance base URL, e.g. `https://gitlab.example.com`.
    pub base_url: String,
    /// Personal/project access token sent as `PRIVATE-TOKEN`.
    pub token: Option<String>,
    /// Wall-clock timeout per request.
    pub timeout: Duration,
    /// Page size for list endpoints.
    pub per_page: u32,
}

impl GitLabOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(30),
            per_page: 100,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum GitLabError {
    #[error("authentication rejected (http {status})")]
    Auth { status: u16 },
    #[error("rate limited")]
    RateLimited { retry_after_seconds: Option<u64> },
    #[error("request timed out")]
    Timeout,
    #[error("not found: {resource}")]
    NotFound { resource: String },
    #[error("server error (http {status})")]
    Server { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl GitLabError {
    /// Map onto the canonical sync `error_category` strings.
    pub fn category(&self) -> &'static str {
        match self {
            GitLabError::Auth { .. } => "auth_error",
            GitLabError::RateLimited { .. } => "rate_limit",
            GitLabError::Timeout => "timeout",
            GitLabError::NotFound { .. } => "repo_not_found",
            GitLabError::Server { .. } => "server_error",
            GitLabError::Network(_) => "network",
            GitLabError::Decode(_) => "exception",
        }
    }
}

/// Per-attempt request accounting, merged into `SyncResult.request_stats`.
#[derive(Debug, Default, Clone)]
pub struct RequestStats {
    pub total_requests: u64,
    pub total_429_hits: u64,
    pub timeout_count: u64,
    pub total_wait_ms: u64,
}

impl RequestStats {
    pub fn avg_wait_time_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_wait_ms as f64 / self.total_requests as f64
        }
    }

    pub fn merge(&mut self, other: &RequestStats) {
        self.total_requests += other.total_requests;
        self.total_429_hits += other.total_429_hits;
        self.timeout_count += other.timeout_count;
        self.total_wait_ms += other.total_wait_ms;
    }
}

#[derive(Debug, Clone)]
pub struct GitLabClient {
    http: Client,
    options: GitLabOptions,
}

impl GitLabClient {
    pub fn new(options: GitLabOptions) -> Result<Self, GitLabError> {
        let http = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| GitLabError::Network(e.to_string()))?;
        Ok(Self { http, options })
    }

    pub fn base_url(&self) -> &str {
        &self.options.base_url
    }

    /// Percent-encode a project path (`group/sub/project`) for use as an id.
    fn encode_project(project: &str) -> String {
        url::form_urlencoded::byte_serialize(project.as_bytes()).collect()
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/v4/{}",
            self.options.base_url.trim_end_matches('/'),
            path
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        stats: &mut RequestStats,
    ) -> Result<T, GitLabError> {
        let url = self.api_url(path);
        let mut req = self.http.get(&url).query(query);
        if let Some(token) = &self.options.token {
            req = req.header("PRIVATE-TOKEN", token.as_str());
        }

        let started = Instant::now();
        stats.total_requests += 1;
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                stats.timeout_count += 1;
                return Err(GitLabError::Timeout);
            }
            Err(e) => return Err(GitLabError::Network(e.to_string())),
        };
        stats.total_wait_ms += started.elapsed().as_millis() as u64;

        let status = resp.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(GitLabError::Auth {
                    status: status.as_u16(),
                })
            }
            StatusCode::NOT_FOUND => Err(GitLabError::NotFound {
                resource: path.to_string(),
            }),
            StatusCode::TOO_MANY_REQUESTS => {
                stats.total_429_hits += 1;
                let retry_after_seconds = resp
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                Err(GitLabError::RateLimited {
                    retry_after_seconds,
                })
            }
            s if s.is_server_error() => Err(GitLabError::Server {
                status: s.as_u16(),
            }),
            s if !s.is_success() => Err(GitLabError::Decode(format!(
                "unexpected http {} from {}",
                s.as_u16(),
                path
            ))),
            _ => resp
                .json::<T>()
                .await
                .map_err(|e| GitLabError::Decode(e.to_string())),
        }
    }

    /// List repository commits, newest first, optionally bounded by a time
    /// window. `page` is 1-based.
    pub async fn list_commits(
        &self,
        project: &str,
        ref_name: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        page: u32,
        stats: &mut RequestStats,
    ) -> Result<Vec<RepoCommit>, GitLabError> {
        let path = format!(
            "projects/{}/repository/commits",
            Self::encode_project(project)
        );
        let mut query: Vec<(&str, String)> = vec![
            ("page", page.to_string()),
            ("per_page", self.options.per_page.to_string()),
            ("with_stats", "true".to_string()),
        ];
        if let Some(r) = ref_name {
            query.push(("ref_name", r.to_string()));
        }
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339()));
        }
        if let Some(until) = until {
            query.push(("until", until.to_rfc3339()));
        }
        self.get_json(&path, &query, stats).await
    }

    /// Fetch the per-file diff of one commit.
    pub async fn commit_diff(
        &self,
        project: &str,
        sha: &str,
        stats: &mut RequestStats,
    ) -> Result<Vec<CommitDiff>, GitLabError> {
        let path = format!(
            "projects/{}/repository/commits/{}/diff",
            Self::encode_project(project),
            sha
        );
        self.get_json(&path, &[], stats).await
    }

    /// List merge requests updated after the given instant, oldest first.
    pub async fn list_merge_requests(
        &self,
        project: &str,
        updated_after: Option<DateTime<Utc>>,
        page: u32,
        stats: &mut RequestStats,
    ) -> Result<Vec<MergeRequest>, GitLabError> {
        let path = format!("projects/{}/merge_requests", Self::encode_project(project));
        let mut query: Vec<(&str, String)> = vec![
            ("page", page.to_string()),
            ("per_page", self.options.per_page.to_string()),
            ("state", "all".to_string()),
            ("order_by", "updated_at".to_string()),
            ("sort", "asc".to_string()),
        ];
        if let Some(after) = updated_after {
            query.push(("updated_after", after.to_rfc3339()));
        }
        self.get_json(&path, &query, stats).await
    }

    /// List notes (review events) on one merge request, oldest first.
    pub async fn list_mr_notes(
        &self,
        project: &str,
        mr_iid: i64,
        page: u32,
        stats: &mut RequestStats,
    ) -> Result<Vec<Note>, GitLabError> {
        let path = format!(
            "projects/{}/merge_requests/{}/notes",
            Self::encode_project(project),
            mr_iid
        );
        let query: Vec<(&str, String)> = vec![
            ("page", page.to_string()),
            ("per_page", self.options.per_page.to_string()),
            ("order_by", "created_at".to_string()),
            ("sort", "asc".to_string()),
        ];
        self.get_json(&path, &query, stats).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_categories_are_canonical() {
        assert_eq!(GitLabError::Auth { status: 401 }.category(), "auth_error");
        assert_eq!(
            GitLabError::RateLimited {
                retry_after_seconds: Some(30)
            }
            .category(),
            "rate_limit"
        );
        assert_eq!(GitLabError::Timeout.category(), "timeout");
        assert_eq!(
            GitLabError::NotFound {
                resource: "projects/x".into()
            }
            .category(),
            "repo_not_found"
        );
        assert_eq!(GitLabError::Server { status: 502 }.category(), "server_error");
        assert_eq!(
            GitLabError::Network("reset".into()).category(),
            "network"
        );
    }

    #[test]
    fn avg_wait_is_zero_without_requests() {
        let stats = RequestStats::default();
        assert_eq!(stats.avg_wait_time_ms(), 0.0);
    }

    #[test]
    fn stats_merge_sums_counters() {
        let mut a = RequestStats {
            total_requests: 2,
            total_429_hits: 1,
            timeout_count: 0,
            total_wait_ms: 100,
        };
        let b = RequestStats {
            total_requests: 3,
            total_429_hits: 0,
            timeout_count: 1,
            total_wait_ms: 50,
        };
        a.merge(&b);
        assert_eq!(a.total_requests, 5);
        assert_eq!(a.total_429_hits, 1);
        assert_eq!(a.timeout_count, 1);
        assert_eq!(a.total_wait_ms, 150);
    }

    #[test]
    fn project_paths_are_percent_encoded() {
        assert_eq!(
            GitLabClient::encode_project("group/sub/project"),
            "group%2Fsub%2Fproject"
        );
    }
}
