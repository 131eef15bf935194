//! Repo registry: the anchor row for everything the sync writes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use super::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum RepoType {
    Git,
    Svn,
    Gitlab,
}

impl RepoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoType::Git => "git",
            RepoType::Svn => "svn",
            RepoType::Gitlab => "gitlab",
        }
    }

    /// The source_type used in artifact paths and patch blob rows.
    pub fn source_type(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(RepoType::Git),
            "svn" => Ok(RepoType::Svn),
            "gitlab" => Ok(RepoType::Gitlab),
            other => Err(format!("unknown repo type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Repo {
    pub repo_id: i64,
    pub repo_type: RepoType,
    pub url: String,
    pub project_key: Option<String>,
    pub default_branch: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Repo {
    /// Idempotent registration keyed by `(repo_type, url)`. The original
    /// row wins; subsequent calls return it unchanged.
    pub async fn upsert(
        pool: &PgPool,
        repo_type: RepoType,
        url: &str,
        project_key: Option<&str>,
        default_branch: Option<&str>,
    ) -> StoreResult<Repo> {
        let inserted = sqlx::query_as::<_, Repo>(
            r#"
            INSERT INTO repos (repo_type, url, project_key, default_branch)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (repo_type, url) DO NOTHING
            RETURNING repo_id, repo_type, url, project_key, default_branch, created_at
            "#,
        )
        .bind(repo_type)
        .bind(url)
        .bind(project_key)
        .bind(default_branch)
        .fetch_optional(pool)
        .await?;

        match inserted {
            Some(repo) => Ok(repo),
            None => Self::find_by_url(pool, repo_type, url)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("repo {repo_type} {url}"))),
        }
    }

    pub async fn find_by_id(pool: &PgPool, repo_id: i64) -> StoreResult<Option<Repo>> {
        let repo = sqlx::query_as::<_, Repo>(
            r#"
            SELECT repo_id, repo_type, url, project_key, default_branch, created_at
            FROM repos
            WHERE repo_id = $1
            "#,
        )
        .bind(repo_id)
        .fetch_optional(pool)
        .await?;
        Ok(repo)
    }

    pub async fn find_by_url(
        pool: &PgPool,
        repo_type: RepoType,
        url: &str,
    ) -> StoreResult<Option<Repo>> {
        let repo = sqlx::query_as::<_, Repo>(
            r#"
            SELECT repo_id, repo_type, url, project_key, default_branch, created_at
            FROM repos
            WHERE repo_type = $1 AND url = $2
            "#,
        )
        .bind(repo_type)
        .bind(url)
        .fetch_optional(pool)
        .await?;
        Ok(repo)
    }

    pub async fn list(
        pool: &PgPool,
        repo_type: Option<RepoType>,
        limit: i64,
    ) -> StoreResult<Vec<Repo>> {
        let repos = sqlx::query_as::<_, Repo>(
            r#"
            SELECT repo_id, repo_type, url, project_key, default_branch, created_at
            FROM repos
            WHERE ($1::text IS NULL OR repo_type = $1)
            ORDER BY repo_id ASC
            LIMIT $2
            "#,
        )
        .bind(repo_type.map(|t| t.as_str().to_string()))
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(repos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_type_round_trips() {
        for raw in ["git", "svn", "gitlab"] {
            assert_eq!(RepoType::from_str(raw).unwrap().as_str(), raw);
        }
        assert!(RepoType::from_str("hg").is_err());
    }

    #[test]
    fn repo_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(RepoType::Gitlab).unwrap(),
            serde_json::json!("gitlab")
        );
    }
}
