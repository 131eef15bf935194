use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A commit as returned by `GET /projects/:id/repository/commits`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoCommit {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
    pub authored_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub committer_name: String,
    #[serde(default)]
    pub committer_email: String,
    pub committed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    #[serde(default)]
    pub web_url: String,
    /// Present only when `with_stats=true`.
    pub stats: Option<CommitStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitStats {
    #[serde(default)]
    pub additions: i64,
    #[serde(default)]
    pub deletions: i64,
    #[serde(default)]
    pub total: i64,
}

/// One file entry from `GET /projects/:id/repository/commits/:sha/diff`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitDiff {
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub new_path: String,
    #[serde(default)]
    pub old_path: String,
    #[serde(default)]
    pub new_file: bool,
    #[serde(default)]
    pub renamed_file: bool,
    #[serde(default)]
    pub deleted_file: bool,
}

/// A merge request as returned by `GET /projects/:id/merge_requests`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: i64,
    pub iid: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub state: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_branch: String,
    #[serde(default)]
    pub target_branch: String,
    pub sha: Option<String>,
    #[serde(default)]
    pub web_url: String,
    pub author: Option<UserRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
}

/// A note (comment / review event) on a merge request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub system: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub author: Option<UserRef>,
}
