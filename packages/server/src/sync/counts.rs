//! The `sync_runs.counts` contract.
//!
//! A run's `counts` jsonb always carries exactly the union of required,
//! optional and limiter fields, copied from the result envelope. The
//! validator lets unknown keys through with a warning but fails on absent
//! required keys so older rows stay readable while new writers stay honest.

use serde_json::{json, Map, Value};

use super::result::SyncResult;

pub const COUNTS_REQUIRED_FIELDS: [&str; 4] = [
    "synced_count",
    "skipped_count",
    "diff_count",
    "degraded_count",
];

pub const COUNTS_OPTIONAL_FIELDS: [&str; 10] = [
    "bulk_count",
    "diff_none_count",
    "scanned_count",
    "inserted_count",
    "synced_mr_count",
    "synced_event_count",
    "skipped_event_count",
    "patch_success",
    "patch_failed",
    "skipped_by_controller",
];

pub const COUNTS_LIMITER_FIELDS: [&str; 4] = [
    "total_requests",
    "total_429_hits",
    "timeout_count",
    "avg_wait_time_ms",
];

/// Build the counts object for a sync run from a validated envelope.
pub fn build_counts_from_result(result: &SyncResult) -> Value {
    let mut map = Map::new();
    map.insert("synced_count".into(), json!(result.synced_count));
    map.insert("skipped_count".into(), json!(result.skipped_count));
    map.insert("diff_count".into(), json!(result.diff_count));
    map.insert("degraded_count".into(), json!(result.degraded_count));

    map.insert("bulk_count".into(), json!(result.bulk_count));
    map.insert("diff_none_count".into(), json!(result.diff_none_count));
    map.insert("scanned_count".into(), json!(result.scanned_count));
    map.insert("inserted_count".into(), json!(result.inserted_count));
    map.insert("synced_mr_count".into(), json!(result.synced_mr_count));
    map.insert("synced_event_count".into(), json!(result.synced_event_count));
    map.insert(
        "skipped_event_count".into(),
        json!(result.skipped_event_count),
    );
    map.insert("patch_success".into(), json!(result.patch_success));
    map.insert("patch_failed".into(), json!(result.patch_failed));
    map.insert(
        "skipped_by_controller".into(),
        json!(result.skipped_by_controller),
    );

    map.insert(
        "total_requests".into(),
        json!(result.request_stats.total_requests),
    );
    map.insert(
        "total_429_hits".into(),
        json!(result.request_stats.total_429_hits),
    );
    map.insert(
        "timeout_count".into(),
        json!(result.request_stats.timeout_count),
    );
    map.insert(
        "avg_wait_time_ms".into(),
        json!(result.request_stats.avg_wait_time_ms),
    );

    Value::Object(map)
}

/// Build an all-zero counts object.
pub fn build_counts() -> Value {
    build_counts_from_result(&SyncResult::default())
}

/// Validate a counts object: required keys must be present non-negative
/// integers; optional/limiter keys must be non-negative when present;
/// unknown keys produce warnings. Returns the warnings.
pub fn validate_counts_schema(counts: &Value) -> Result<Vec<String>, String> {
    let map = counts
        .as_object()
        .ok_or_else(|| "counts must be a JSON object".to_string())?;

    let mut warnings = Vec::new();

    for field in COUNTS_REQUIRED_FIELDS {
        match map.get(field) {
            None => return Err(format!("missing required count `{field}`")),
            Some(v) => check_counter(field, v)?,
        }
    }

    for field in COUNTS_OPTIONAL_FIELDS {
        if let Some(v) = map.get(field) {
            check_counter(field, v)?;
        }
    }

    for field in COUNTS_LIMITER_FIELDS {
        if let Some(v) = map.get(field) {
            let ok = v
                .as_f64()
                .map(|n| n >= 0.0)
                .unwrap_or(false);
            if !ok {
                return Err(format!("count `{field}` must be a non-negative number"));
            }
        }
    }

    for key in map.keys() {
        let known = COUNTS_REQUIRED_FIELDS.contains(&key.as_str())
            || COUNTS_OPTIONAL_FIELDS.contains(&key.as_str())
            || COUNTS_LIMITER_FIELDS.contains(&key.as_str());
        if !known {
            warnings.push(format!("unknown count `{key}`"));
        }
    }

    Ok(warnings)
}

fn check_counter(field: &str, value: &Value) -> Result<(), String> {
    match value.as_i64() {
        Some(v) if v >= 0 => Ok(()),
        Some(v) => Err(format!("count `{field}` is negative ({v})")),
        None => Err(format!("count `{field}` must be an integer")),
    }
}
