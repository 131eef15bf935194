//! Namespaced JSON KV over `logbook.kv`.
//!
//! The sync control plane keeps three namespaces here: `scm.sync` for
//! cursors, `scm.sync_health` for circuit breaker state and
//! `scm.sync_pauses` for per-repo pauses. Read-modify-write callers take
//! the row lock via [`kv_get_for_update`] inside their own transaction.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};

use super::StoreResult;
use crate::sync::cursor::{
    gitlab_cursor_key, svn_cursor_key, GitlabCursor, SvnCursor, CURSOR_NAMESPACE,
};

pub const NAMESPACE_SYNC_HEALTH: &str = "scm.sync_health";
pub const NAMESPACE_SYNC_PAUSES: &str = "scm.sync_pauses";

pub async fn kv_get(pool: &PgPool, namespace: &str, key: &str) -> StoreResult<Option<Value>> {
    let value = sqlx::query_scalar::<_, Value>(
        "SELECT value_json FROM kv WHERE namespace = $1 AND key = $2",
    )
    .bind(namespace)
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(value)
}

pub async fn kv_set(pool: &PgPool, namespace: &str, key: &str, value: &Value) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO kv (namespace, key, value_json)
        VALUES ($1, $2, $3)
        ON CONFLICT (namespace, key) DO UPDATE
        SET value_json = EXCLUDED.value_json,
            updated_at = now()
        "#,
    )
    .bind(namespace)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn kv_delete(pool: &PgPool, namespace: &str, key: &str) -> StoreResult<bool> {
    let result = sqlx::query("DELETE FROM kv WHERE namespace = $1 AND key = $2")
        .bind(namespace)
        .bind(key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Lock and read one KV row inside the caller's transaction.
pub async fn kv_get_for_update(
    conn: &mut PgConnection,
    namespace: &str,
    key: &str,
) -> StoreResult<Option<Value>> {
    let value = sqlx::query_scalar::<_, Value>(
        "SELECT value_json FROM kv WHERE namespace = $1 AND key = $2 FOR UPDATE",
    )
    .bind(namespace)
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(value)
}

/// Upsert inside the caller's transaction.
pub async fn kv_set_in_tx(
    conn: &mut PgConnection,
    namespace: &str,
    key: &str,
    value: &Value,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO kv (namespace, key, value_json)
        VALUES ($1, $2, $3)
        ON CONFLICT (namespace, key) DO UPDATE
        SET value_json = EXCLUDED.value_json,
            updated_at = now()
        "#,
    )
    .bind(namespace)
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KvEntry {
    pub namespace: String,
    pub key: String,
    pub value_json: Value,
    pub updated_at: DateTime<Utc>,
}

pub async fn kv_list(pool: &PgPool, namespace: &str) -> StoreResult<Vec<KvEntry>> {
    let rows = sqlx::query_as::<_, KvEntry>(
        r#"
        SELECT namespace, key, value_json, updated_at
        FROM kv
        WHERE namespace = $1
        ORDER BY key ASC
        "#,
    )
    .bind(namespace)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// All incremental cursors, for the status surface.
pub async fn list_kv_cursors(pool: &PgPool) -> StoreResult<Vec<KvEntry>> {
    kv_list(pool, CURSOR_NAMESPACE).await
}

pub async fn load_gitlab_cursor(pool: &PgPool, repo_id: i64) -> StoreResult<Option<GitlabCursor>> {
    let value = kv_get(pool, CURSOR_NAMESPACE, &gitlab_cursor_key(repo_id)).await?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

pub async fn save_gitlab_cursor(
    pool: &PgPool,
    repo_id: i64,
    cursor: &GitlabCursor,
) -> StoreResult<()> {
    let value = serde_json::to_value(cursor).unwrap_or(Value::Null);
    kv_set(pool, CURSOR_NAMESPACE, &gitlab_cursor_key(repo_id), &value).await
}

pub async fn load_svn_cursor(pool: &PgPool, repo_id: i64) -> StoreResult<Option<SvnCursor>> {
    let value = kv_get(pool, CURSOR_NAMESPACE, &svn_cursor_key(repo_id)).await?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

pub async fn save_svn_cursor(pool: &PgPool, repo_id: i64, cursor: &SvnCursor) -> StoreResult<()> {
    let value = serde_json::to_value(cursor).unwrap_or(Value::Null);
    kv_set(pool, CURSOR_NAMESPACE, &svn_cursor_key(repo_id), &value).await
}

/// Record a per-repo pause in `scm.sync_pauses`.
pub async fn set_sync_pause(
    pool: &PgPool,
    repo_id: i64,
    job_type: &str,
    reason_code: &str,
    reason: &str,
    paused_until: DateTime<Utc>,
) -> StoreResult<()> {
    let key = format!("{repo_id}:{job_type}");
    let value = serde_json::json!({
        "repo_id": repo_id,
        "job_type": job_type,
        "reason_code": reason_code,
        "reason": reason,
        "paused_at": Utc::now().to_rfc3339(),
        "paused_until": paused_until.to_rfc3339(),
    });
    kv_set(pool, NAMESPACE_SYNC_PAUSES, &key, &value).await
}

pub async fn clear_sync_pause(pool: &PgPool, repo_id: i64, job_type: &str) -> StoreResult<bool> {
    let key = format!("{repo_id}:{job_type}");
    kv_delete(pool, NAMESPACE_SYNC_PAUSES, &key).await
}

pub async fn list_sync_pauses(pool: &PgPool) -> StoreResult<Vec<KvEntry>> {
    kv_list(pool, NAMESPACE_SYNC_PAUSES).await
}
