//! Commit / revision / patch-blob fact rows.
//!
//! All writes are idempotent `ON CONFLICT DO NOTHING` upserts keyed by the
//! natural key, so re-running a sync over an already-ingested window only
//! bumps skip counters.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use super::StoreResult;

#[derive(Debug, Clone, FromRow)]
pub struct GitCommitRow {
    pub repo_id: i64,
    pub sha: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub parent_shas: Value,
    pub web_url: Option<String>,
    pub stats_json: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl GitCommitRow {
    /// Returns true when the row was newly written.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        pool: &PgPool,
        repo_id: i64,
        sha: &str,
        author_name: Option<&str>,
        author_email: Option<&str>,
        committed_at: Option<DateTime<Utc>>,
        message: Option<&str>,
        parent_shas: &Value,
        web_url: Option<&str>,
        stats_json: Option<&Value>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO commits (
                repo_id, sha, author_name, author_email, committed_at,
                message, parent_shas, web_url, stats_json
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (repo_id, sha) DO NOTHING
            "#,
        )
        .bind(repo_id)
        .bind(sha)
        .bind(author_name)
        .bind(author_email)
        .bind(committed_at)
        .bind(message)
        .bind(parent_shas)
        .bind(web_url)
        .bind(stats_json)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_for_repo(pool: &PgPool, repo_id: i64) -> StoreResult<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM commits WHERE repo_id = $1")
                .bind(repo_id)
                .fetch_one(pool)
                .await?;
        Ok(count)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SvnRevisionRow {
    pub repo_id: i64,
    pub rev: i64,
    pub author: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub changed_paths_json: Value,
    pub created_at: DateTime<Utc>,
}

impl SvnRevisionRow {
    pub async fn upsert(
        pool: &PgPool,
        repo_id: i64,
        rev: i64,
        author: Option<&str>,
        committed_at: Option<DateTime<Utc>>,
        message: Option<&str>,
        changed_paths_json: &Value,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO svn_revisions (
                repo_id, rev, author, committed_at, message, changed_paths_json
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (repo_id, rev) DO NOTHING
            "#,
        )
        .bind(repo_id)
        .bind(rev)
        .bind(author)
        .bind(committed_at)
        .bind(message)
        .bind(changed_paths_json)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PatchBlob {
    pub id: i64,
    pub source_type: String,
    pub source_id: String,
    pub sha256: String,
    pub content_uri: String,
    pub ext: String,
    pub size_bytes: i64,
    pub chunking_version: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl PatchBlob {
    /// Content-addressed insert; an identical `(source_type, source_id,
    /// sha256)` row is a no-op.
    pub async fn upsert(
        pool: &PgPool,
        source_type: &str,
        source_id: &str,
        sha256: &str,
        content_uri: &str,
        ext: &str,
        size_bytes: i64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO patch_blobs (
                source_type, source_id, sha256, content_uri, ext, size_bytes
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_type, source_id, sha256) DO NOTHING
            "#,
        )
        .bind(source_type)
        .bind(source_id)
        .bind(sha256)
        .bind(content_uri)
        .bind(ext)
        .bind(size_bytes)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stamp the chunker version on rows that predate it.
    pub async fn backfill_chunking_version(
        pool: &PgPool,
        source_type: &str,
        version: i32,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE patch_blobs
            SET chunking_version = $2
            WHERE source_type = $1 AND chunking_version IS NULL
            "#,
        )
        .bind(source_type)
        .bind(version)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_for_source(pool: &PgPool, source_type: &str) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM patch_blobs WHERE source_type = $1",
        )
        .bind(source_type)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }
}
