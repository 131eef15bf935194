//! Governance write-audit rows for outbox reconciliation.
//!
//! One audit row per `(outbox_id, event_type)` pair; the partial unique
//! index makes every insert here idempotent, which is what lets the
//! reaper re-run its backfill without producing duplicates. The
//! `outbox_id` inside `evidence_refs_json` is carried by value, not as a
//! foreign key.

use serde_json::{json, Value};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::redact::redact;
use crate::store::StoreResult;

pub const EVENT_OUTBOX_FLUSH_SUCCESS: &str = "outbox_flush_success";
pub const EVENT_OUTBOX_FLUSH_DEDUP_HIT: &str = "outbox_flush_dedup_hit";
pub const EVENT_OUTBOX_FLUSH_DEAD: &str = "outbox_flush_dead";
pub const EVENT_OUTBOX_STALE: &str = "outbox_stale";

/// Insert an audit row if absent. Returns true when a row was written.
pub async fn ensure_audit(
    pool: &PgPool,
    event_type: &str,
    outbox_id: Uuid,
    extra: Option<&Value>,
) -> StoreResult<bool> {
    let evidence = json!({
        "outbox_id": outbox_id.to_string(),
        "extra": extra.cloned().unwrap_or(Value::Null),
    });

    let result = sqlx::query(
        r#"
        INSERT INTO write_audit (event_type, outbox_id, evidence_refs_json)
        VALUES ($1, $2, $3)
        ON CONFLICT (outbox_id, event_type) WHERE outbox_id IS NOT NULL DO NOTHING
        "#,
    )
    .bind(event_type)
    .bind(outbox_id)
    .bind(&evidence)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxRow {
    pub outbox_id: Uuid,
    pub status: String,
    pub last_error: Option<String>,
}

/// Outbox rows flushed as `sent` that carry neither a success nor a
/// dedup-hit audit.
pub async fn sent_outboxes_missing_audit(pool: &PgPool) -> StoreResult<Vec<OutboxRow>> {
    let rows = sqlx::query_as::<_, OutboxRow>(
        r#"
        SELECT o.outbox_id, o.status, o.last_error
        FROM outbox_memory o
        WHERE o.status = 'sent'
          AND NOT EXISTS (
              SELECT 1 FROM write_audit a
              WHERE a.outbox_id = o.outbox_id
                AND a.event_type IN ($1, $2)
          )
        ORDER BY o.outbox_id
        "#,
    )
    .bind(EVENT_OUTBOX_FLUSH_SUCCESS)
    .bind(EVENT_OUTBOX_FLUSH_DEDUP_HIT)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Outbox rows that died without an `outbox_flush_dead` audit.
pub async fn dead_outboxes_missing_audit(pool: &PgPool) -> StoreResult<Vec<OutboxRow>> {
    let rows = sqlx::query_as::<_, OutboxRow>(
        r#"
        SELECT o.outbox_id, o.status, o.last_error
        FROM outbox_memory o
        WHERE o.status = 'dead'
          AND NOT EXISTS (
              SELECT 1 FROM write_audit a
              WHERE a.outbox_id = o.outbox_id
                AND a.event_type = $1
          )
        ORDER BY o.outbox_id
        "#,
    )
    .bind(EVENT_OUTBOX_FLUSH_DEAD)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Back-fill the missing audit for one sent outbox.
pub async fn backfill_sent_audit(pool: &PgPool, outbox: &OutboxRow) -> StoreResult<bool> {
    ensure_audit(pool, EVENT_OUTBOX_FLUSH_SUCCESS, outbox.outbox_id, None).await
}

/// Back-fill the missing audit for one dead outbox, preserving its error.
pub async fn backfill_dead_audit(pool: &PgPool, outbox: &OutboxRow) -> StoreResult<bool> {
    let extra = outbox
        .last_error
        .as_deref()
        .map(|e| json!({ "last_error": redact(e) }));
    ensure_audit(
        pool,
        EVENT_OUTBOX_FLUSH_DEAD,
        outbox.outbox_id,
        extra.as_ref(),
    )
    .await
}

/// Emit the stale-lease audit for a reaped job tied to an outbox.
pub async fn emit_stale_audit(
    pool: &PgPool,
    outbox_id: Uuid,
    last_error: Option<&str>,
) -> StoreResult<bool> {
    let extra = json!({
        "outbox_id": outbox_id.to_string(),
        "last_error": last_error.map(redact),
    });
    ensure_audit(pool, EVENT_OUTBOX_STALE, outbox_id, Some(&extra)).await
}

/// Count audits by event type (reaper report mode).
pub async fn count_audits(pool: &PgPool, event_type: &str) -> StoreResult<i64> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM write_audit WHERE event_type = $1")
            .bind(event_type)
            .fetch_one(pool)
            .await?;
    Ok(count)
}
