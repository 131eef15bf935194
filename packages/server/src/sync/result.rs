//! The sync result envelope: the only shape a handler may return.
//!
//! Results are mergeable (`a + b`) so multi-batch handlers can fold their
//! partial results, and every envelope passes the contract validator before
//! it is persisted. Legacy `ok`/`count` fields from older handlers are
//! normalized on input with a warning.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Canonical error categories (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AuthError,
    AuthMissing,
    AuthInvalid,
    RepoNotFound,
    RepoTypeUnknown,
    PermissionDenied,
    RateLimit,
    Timeout,
    Network,
    ServerError,
    Connection,
    Exception,
    Unknown,
    LeaseLost,
    UnknownJobType,
    LockHeld,
    ContractError,
    CircuitOpen,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 18] = [
        ErrorCategory::AuthError,
        ErrorCategory::AuthMissing,
        ErrorCategory::AuthInvalid,
        ErrorCategory::RepoNotFound,
        ErrorCategory::RepoTypeUnknown,
        ErrorCategory::PermissionDenied,
        ErrorCategory::RateLimit,
        ErrorCategory::Timeout,
        ErrorCategory::Network,
        ErrorCategory::ServerError,
        ErrorCategory::Connection,
        ErrorCategory::Exception,
        ErrorCategory::Unknown,
        ErrorCategory::LeaseLost,
        ErrorCategory::UnknownJobType,
        ErrorCategory::LockHeld,
        ErrorCategory::ContractError,
        ErrorCategory::CircuitOpen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::AuthMissing => "auth_missing",
            ErrorCategory::AuthInvalid => "auth_invalid",
            ErrorCategory::RepoNotFound => "repo_not_found",
            ErrorCategory::RepoTypeUnknown => "repo_type_unknown",
            ErrorCategory::PermissionDenied => "permission_denied",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Exception => "exception",
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::LeaseLost => "lease_lost",
            ErrorCategory::UnknownJobType => "unknown_job_type",
            ErrorCategory::LockHeld => "lock_held",
            ErrorCategory::ContractError => "contract_error",
            ErrorCategory::CircuitOpen => "circuit_open",
        }
    }

    /// Requeue with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit
                | ErrorCategory::Timeout
                | ErrorCategory::Network
                | ErrorCategory::ServerError
                | ErrorCategory::Connection
                | ErrorCategory::Exception
        )
    }

    /// Straight to `dead`, no retry.
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::AuthError
                | ErrorCategory::AuthMissing
                | ErrorCategory::AuthInvalid
                | ErrorCategory::RepoNotFound
                | ErrorCategory::RepoTypeUnknown
                | ErrorCategory::ContractError
                | ErrorCategory::UnknownJobType
        )
    }

    /// Soft re-queue: no attempt counter increment.
    pub fn is_soft_requeue(&self) -> bool {
        matches!(self, ErrorCategory::LockHeld | ErrorCategory::LeaseLost)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = SyncResultValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| SyncResultValidationError::UnknownErrorCategory(s.to_string()))
    }
}

/// Request accounting carried inside the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestStatsSummary {
    pub total_requests: i64,
    pub total_429_hits: i64,
    pub timeout_count: i64,
    pub avg_wait_time_ms: f64,
}

impl RequestStatsSummary {
    fn merged(&self, other: &RequestStatsSummary) -> RequestStatsSummary {
        let total = self.total_requests + other.total_requests;
        let avg = if total == 0 {
            0.0
        } else {
            (self.avg_wait_time_ms * self.total_requests as f64
                + other.avg_wait_time_ms * other.total_requests as f64)
                / total as f64
        };
        RequestStatsSummary {
            total_requests: total,
            total_429_hits: self.total_429_hits + other.total_429_hits,
            timeout_count: self.timeout_count + other.timeout_count,
            avg_wait_time_ms: avg,
        }
    }
}

impl From<&gitlab::RequestStats> for RequestStatsSummary {
    fn from(stats: &gitlab::RequestStats) -> Self {
        RequestStatsSummary {
            total_requests: stats.total_requests as i64,
            total_429_hits: stats.total_429_hits as i64,
            timeout_count: stats.timeout_count as i64,
            avg_wait_time_ms: stats.avg_wait_time_ms(),
        }
    }
}

/// Normalized summary of what one sync attempt did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncResult {
    pub success: bool,
    pub has_more: bool,

    pub synced_count: i64,
    pub skipped_count: i64,
    pub diff_count: i64,
    pub degraded_count: i64,
    pub bulk_count: i64,
    pub diff_none_count: i64,
    pub scanned_count: i64,
    pub inserted_count: i64,
    pub synced_mr_count: i64,
    pub synced_event_count: i64,
    pub skipped_event_count: i64,
    pub patch_success: i64,
    pub patch_failed: i64,
    pub skipped_by_controller: i64,

    pub request_stats: RequestStatsSummary,
    pub degraded_reasons: BTreeMap<String, i64>,
    pub unrecoverable_errors: Vec<String>,

    pub cursor_after: Option<Value>,
    pub cursor_persisted: bool,
    pub watermark_updated: bool,

    pub locked: bool,
    pub skipped: bool,

    pub mode: Option<String>,
    pub dry_run: bool,
    pub last_rev: Option<i64>,
    pub last_commit_sha: Option<String>,
    pub last_commit_ts: Option<String>,
    pub message: Option<String>,

    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
}

impl Default for SyncResult {
    fn default() -> Self {
        SyncResult {
            success: true,
            has_more: false,
            synced_count: 0,
            skipped_count: 0,
            diff_count: 0,
            degraded_count: 0,
            bulk_count: 0,
            diff_none_count: 0,
            scanned_count: 0,
            inserted_count: 0,
            synced_mr_count: 0,
            synced_event_count: 0,
            skipped_event_count: 0,
            patch_success: 0,
            patch_failed: 0,
            skipped_by_controller: 0,
            request_stats: RequestStatsSummary::default(),
            degraded_reasons: BTreeMap::new(),
            unrecoverable_errors: Vec::new(),
            cursor_after: None,
            cursor_persisted: false,
            watermark_updated: false,
            locked: false,
            skipped: false,
            mode: None,
            dry_run: false,
            last_rev: None,
            last_commit_sha: None,
            last_commit_ts: None,
            message: None,
            error: None,
            error_category: None,
        }
    }
}

impl SyncResult {
    /// Successful attempt that found nothing new.
    pub fn for_no_data(cursor_after: Option<Value>) -> Self {
        SyncResult {
            cursor_after,
            ..Default::default()
        }
    }

    /// Failed attempt. The error string is stored as given; callers scrub
    /// secrets before building the envelope.
    pub fn for_error(error: impl Into<String>, category: ErrorCategory) -> Self {
        SyncResult {
            success: false,
            error: Some(error.into()),
            error_category: Some(category),
            ..Default::default()
        }
    }

    /// Attempt skipped because an external lock (e.g. watermark) was held.
    pub fn for_lock_held(message: impl Into<String>) -> Self {
        SyncResult {
            locked: true,
            skipped: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// A full diff was written.
    pub fn record_diff_success(&mut self) {
        self.diff_count += 1;
    }

    /// Diff fetch failed but a ministat/diffstat was still written.
    pub fn record_diff_degraded(&mut self, reason: &str) {
        self.diff_count += 1;
        self.degraded_count += 1;
        *self.degraded_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    /// `diff_mode=none`: diff fetch skipped entirely.
    pub fn record_diff_none(&mut self) {
        self.diff_none_count += 1;
    }

    /// Commit bypassed diff because its file count exceeded the limit.
    pub fn record_bulk(&mut self) {
        self.bulk_count += 1;
    }

    /// `n` records filtered by dedup / watermark / idempotency.
    pub fn record_dedup(&mut self, n: i64) {
        self.skipped_count += n;
    }
}

impl Add for SyncResult {
    type Output = SyncResult;

    fn add(self, other: SyncResult) -> SyncResult {
        let mut degraded_reasons = self.degraded_reasons;
        for (reason, count) in other.degraded_reasons {
            *degraded_reasons.entry(reason).or_insert(0) += count;
        }

        let mut unrecoverable_errors = self.unrecoverable_errors;
        unrecoverable_errors.extend(other.unrecoverable_errors);

        SyncResult {
            success: self.success && other.success,
            has_more: self.has_more || other.has_more,
            synced_count: self.synced_count + other.synced_count,
            skipped_count: self.skipped_count + other.skipped_count,
            diff_count: self.diff_count + other.diff_count,
            degraded_count: self.degraded_count + other.degraded_count,
            bulk_count: self.bulk_count + other.bulk_count,
            diff_none_count: self.diff_none_count + other.diff_none_count,
            scanned_count: self.scanned_count + other.scanned_count,
            inserted_count: self.inserted_count + other.inserted_count,
            synced_mr_count: self.synced_mr_count + other.synced_mr_count,
            synced_event_count: self.synced_event_count + other.synced_event_count,
            skipped_event_count: self.skipped_event_count + other.skipped_event_count,
            patch_success: self.patch_success + other.patch_success,
            patch_failed: self.patch_failed + other.patch_failed,
            skipped_by_controller: self.skipped_by_controller + other.skipped_by_controller,
            request_stats: self.request_stats.merged(&other.request_stats),
            degraded_reasons,
            unrecoverable_errors,
            cursor_after: other.cursor_after.or(self.cursor_after),
            cursor_persisted: self.cursor_persisted || other.cursor_persisted,
            watermark_updated: self.watermark_updated || other.watermark_updated,
            locked: self.locked || other.locked,
            skipped: self.skipped || other.skipped,
            mode: other.mode.or(self.mode),
            dry_run: self.dry_run || other.dry_run,
            last_rev: other.last_rev.or(self.last_rev),
            last_commit_sha: other.last_commit_sha.or(self.last_commit_sha),
            last_commit_ts: other.last_commit_ts.or(self.last_commit_ts),
            message: other.message.or(self.message),
            error: self.error.or(other.error),
            error_category: self.error_category.or(other.error_category),
        }
    }
}

/// Legacy field names accepted on input and mapped with a warning.
pub const LEGACY_FIELD_MAPPING: [(&str, &str); 2] =
    [("ok", "success"), ("count", "synced_count")];

const COUNTER_FIELDS: [&str; 15] = [
    "synced_count",
    "skipped_count",
    "diff_count",
    "degraded_count",
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
    "count",
];

const KNOWN_FIELDS: [&str; 31] = [
    "success",
    "has_more",
    "synced_count",
    "skipped_count",
    "diff_count",
    "degraded_count",
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
    "request_stats",
    "degraded_reasons",
    "unrecoverable_errors",
    "cursor_after",
    "cursor_persisted",
    "watermark_updated",
    "locked",
    "skipped",
    "mode",
    "dry_run",
    "last_rev",
    "last_commit_sha",
    "last_commit_ts",
    "message",
    "error",
];

#[derive(Debug, Error, PartialEq)]
pub enum SyncResultValidationError {
    #[error("result must be a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has wrong type (expected {expected})")]
    WrongType {
        field: String,
        expected: &'static str,
    },
    #[error("counter `{field}` is negative ({value})")]
    NegativeCounter { field: String, value: i64 },
    #[error("unknown error_category `{0}`")]
    UnknownErrorCategory(String),
    #[error("success=false requires error and error_category")]
    MissingErrorDetail,
}

/// Outcome of a successful validation: normalization warnings only.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
}

/// Map legacy field names onto their v2 equivalents, in place. Returns a
/// warning per mapped field.
pub fn normalize_sync_result(value: &mut Value) -> Vec<String> {
    let mut warnings = Vec::new();
    let Some(map) = value.as_object_mut() else {
        return warnings;
    };
    for (legacy, target) in LEGACY_FIELD_MAPPING {
        if map.contains_key(legacy) && !map.contains_key(target) {
            if let Some(v) = map.remove(legacy) {
                map.insert(target.to_string(), v);
                warnings.push(format!("legacy field `{legacy}` mapped to `{target}`"));
            }
        }
    }
    warnings
}

/// Validate a JSON envelope against the result contract.
///
/// Normalizes legacy fields first. Unknown fields warn but pass; missing
/// `success`, mistyped fields, negative counters, unknown categories and a
/// failure without error detail all reject.
pub fn validate_sync_result(value: &mut Value) -> Result<ValidationReport, SyncResultValidationError> {
    let mut report = ValidationReport {
        warnings: normalize_sync_result(value),
    };

    let map = value
        .as_object()
        .ok_or(SyncResultValidationError::NotAnObject)?;

    let success = match map.get("success") {
        None => return Err(SyncResultValidationError::MissingField("success")),
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            return Err(SyncResultValidationError::WrongType {
                field: "success".into(),
                expected: "bool",
            })
        }
    };

    for field in COUNTER_FIELDS {
        match map.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) => {
                let Some(v) = n.as_i64() else {
                    return Err(SyncResultValidationError::WrongType {
                        field: field.into(),
                        expected: "integer",
                    });
                };
                if v < 0 {
                    return Err(SyncResultValidationError::NegativeCounter {
                        field: field.into(),
                        value: v,
                    });
                }
            }
            Some(_) => {
                return Err(SyncResultValidationError::WrongType {
                    field: field.into(),
                    expected: "integer",
                })
            }
        }
    }

    match map.get("error_category") {
        None | Some(Value::Null) => {
            if !success {
                return Err(SyncResultValidationError::MissingErrorDetail);
            }
        }
        Some(Value::String(s)) => {
            let _ = ErrorCategory::from_str(s)?;
            if !success && map.get("error").and_then(Value::as_str).is_none() {
                return Err(SyncResultValidationError::MissingErrorDetail);
            }
        }
        Some(_) => {
            return Err(SyncResultValidationError::WrongType {
                field: "error_category".into(),
                expected: "string",
            })
        }
    }

    for key in map.keys() {
        if !KNOWN_FIELDS.contains(&key.as_str()) && key != "error_category" && key != "ok" {
            report.warnings.push(format!("unknown field `{key}`"));
        }
    }

    Ok(report)
}

/// Parse and validate a JSON envelope into a typed [`SyncResult`].
pub fn sync_result_from_value(
    mut value: Value,
) -> Result<(SyncResult, ValidationReport), SyncResultValidationError> {
    let report = validate_sync_result(&mut value)?;
    let result: SyncResult =
        serde_json::from_value(value).map_err(|_| SyncResultValidationError::NotAnObject)?;
    Ok((result, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_zeroed_and_successful() {
        let result = SyncResult::default();
        assert!(result.success);
        assert_eq!(result.synced_count, 0);
        assert_eq!(result.diff_count, 0);
        assert_eq!(result.degraded_count, 0);
        assert_eq!(result.skipped_count, 0);
        assert_eq!(result.bulk_count, 0);
        assert_eq!(result.diff_none_count, 0);
    }

    #[test]
    fn diff_success_counts() {
        let mut result = SyncResult::default();
        result.synced_count = 5;
        for _ in 0..5 {
            result.record_diff_success();
        }
        assert_eq!(result.diff_count, 5);
        assert_eq!(result.degraded_count, 0);
    }

    #[test]
    fn degraded_diff_counts_both() {
        let mut result = SyncResult::default();
        result.record_diff_degraded("timeout");
        assert_eq!(result.diff_count, 1);
        assert_eq!(result.degraded_count, 1);
        assert_eq!(result.degraded_reasons.get("timeout"), Some(&1));
    }

    #[test]
    fn mixed_success_and_degraded() {
        let mut result = SyncResult::default();
        result.synced_count = 5;
        for _ in 0..3 {
            result.record_diff_success();
        }
        result.record_diff_degraded("timeout");
        result.record_diff_degraded("http_error");
        assert_eq!(result.diff_count, 5);
        assert_eq!(result.degraded_count, 2);
        assert_eq!(result.degraded_reasons.get("timeout"), Some(&1));
        assert_eq!(result.degraded_reasons.get("http_error"), Some(&1));
    }

    #[test]
    fn diff_none_leaves_diff_count_untouched() {
        let mut result = SyncResult::default();
        for _ in 0..10 {
            result.record_diff_none();
        }
        assert_eq!(result.diff_count, 0);
        assert_eq!(result.diff_none_count, 10);
    }

    #[test]
    fn dedup_adds_to_skipped() {
        let mut result = SyncResult::default();
        result.record_dedup(5);
        result.record_dedup(2);
        assert_eq!(result.skipped_count, 7);
    }

    #[test]
    fn merge_sums_counters_and_unions_maps() {
        let mut a = SyncResult::default();
        a.synced_count = 5;
        a.record_diff_degraded("timeout");
        let mut b = SyncResult::default();
        b.synced_count = 3;
        b.record_diff_degraded("timeout");
        b.record_diff_degraded("http_error");

        let merged = a + b;
        assert_eq!(merged.synced_count, 8);
        assert_eq!(merged.diff_count, 3);
        assert_eq!(merged.degraded_count, 3);
        assert_eq!(merged.degraded_reasons.get("timeout"), Some(&2));
        assert_eq!(merged.degraded_reasons.get("http_error"), Some(&1));
    }

    #[test]
    fn merge_keeps_newer_cursor_and_ands_success() {
        let mut a = SyncResult::default();
        a.cursor_after = Some(json!({"sha": "old"}));
        let mut b = SyncResult::for_error("boom", ErrorCategory::Network);
        b.cursor_after = Some(json!({"sha": "new"}));

        let merged = a + b;
        assert!(!merged.success);
        assert_eq!(merged.cursor_after, Some(json!({"sha": "new"})));
        assert_eq!(merged.error_category, Some(ErrorCategory::Network));
    }

    #[test]
    fn merge_ors_locked_and_skipped() {
        let a = SyncResult::for_lock_held("watermark busy");
        let b = SyncResult::default();
        let merged = b + a;
        assert!(merged.locked);
        assert!(merged.skipped);
    }

    #[test]
    fn merge_averages_request_stats_by_weight() {
        let mut a = SyncResult::default();
        a.request_stats = RequestStatsSummary {
            total_requests: 2,
            total_429_hits: 1,
            timeout_count: 0,
            avg_wait_time_ms: 100.0,
        };
        let mut b = SyncResult::default();
        b.request_stats = RequestStatsSummary {
            total_requests: 2,
            total_429_hits: 0,
            timeout_count: 1,
            avg_wait_time_ms: 50.0,
        };
        let merged = a + b;
        assert_eq!(merged.request_stats.total_requests, 4);
        assert_eq!(merged.request_stats.total_429_hits, 1);
        assert_eq!(merged.request_stats.timeout_count, 1);
        assert!((merged.request_stats.avg_wait_time_ms - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn for_no_data_keeps_cursor() {
        let result = SyncResult::for_no_data(Some(json!({"sha": "abc123"})));
        assert!(result.success);
        assert_eq!(result.synced_count, 0);
        assert_eq!(result.cursor_after, Some(json!({"sha": "abc123"})));
    }

    #[test]
    fn for_error_fills_detail() {
        let result = SyncResult::for_error("Connection timeout", ErrorCategory::Timeout);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Connection timeout"));
        assert_eq!(result.error_category, Some(ErrorCategory::Timeout));
    }

    #[test]
    fn retry_policy_matches_closed_set() {
        assert!(ErrorCategory::RateLimit.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::AuthMissing.is_non_retryable());
        assert!(ErrorCategory::ContractError.is_non_retryable());
        assert!(ErrorCategory::UnknownJobType.is_non_retryable());
        assert!(ErrorCategory::LockHeld.is_soft_requeue());
        assert!(ErrorCategory::LeaseLost.is_soft_requeue());
        assert!(!ErrorCategory::CircuitOpen.is_retryable());
        assert!(!ErrorCategory::CircuitOpen.is_non_retryable());
    }

    #[test]
    fn category_round_trips_through_strings() {
        for category in ErrorCategory::ALL {
            assert_eq!(ErrorCategory::from_str(category.as_str()).unwrap(), category);
        }
        assert!(ErrorCategory::from_str("bogus").is_err());
    }

    #[test]
    fn legacy_fields_are_mapped_with_warning() {
        let mut value = json!({"ok": true, "count": 7});
        let report = validate_sync_result(&mut value).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["synced_count"], 7);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn missing_success_is_rejected() {
        let mut value = json!({"synced_count": 1});
        assert_eq!(
            validate_sync_result(&mut value),
            Err(SyncResultValidationError::MissingField("success"))
        );
    }

    #[test]
    fn negative_counter_is_rejected() {
        let mut value = json!({"success": true, "synced_count": -1});
        assert!(matches!(
            validate_sync_result(&mut value),
            Err(SyncResultValidationError::NegativeCounter { .. })
        ));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let mut value = json!({"success": "yes"});
        assert!(matches!(
            validate_sync_result(&mut value),
            Err(SyncResultValidationError::WrongType { .. })
        ));
        let mut value = json!({"success": true, "diff_count": "three"});
        assert!(matches!(
            validate_sync_result(&mut value),
            Err(SyncResultValidationError::WrongType { .. })
        ));
    }

    #[test]
    fn unknown_category_is_rejected() {
        let mut value = json!({"success": false, "error": "x", "error_category": "weird"});
        assert!(matches!(
            validate_sync_result(&mut value),
            Err(SyncResultValidationError::UnknownErrorCategory(_))
        ));
    }

    #[test]
    fn failure_without_detail_is_rejected() {
        let mut value = json!({"success": false});
        assert_eq!(
            validate_sync_result(&mut value),
            Err(SyncResultValidationError::MissingErrorDetail)
        );
        let mut value = json!({"success": false, "error_category": "timeout"});
        assert_eq!(
            validate_sync_result(&mut value),
            Err(SyncResultValidationError::MissingErrorDetail)
        );
    }

    #[test]
    fn unknown_fields_warn_but_pass() {
        let mut value = json!({"success": true, "custom_hint": 1});
        let report = validate_sync_result(&mut value).unwrap();
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("custom_hint")));
    }

    #[test]
    fn typed_round_trip_survives_validation() {
        let mut result = SyncResult::default();
        result.synced_count = 10;
        result.record_diff_degraded("timeout");
        result.cursor_after = Some(json!({"sha": "abc", "ts": "2024-01-15T12:00:00Z"}));

        let value = serde_json::to_value(&result).unwrap();
        let (parsed, report) = sync_result_from_value(value).unwrap();
        assert_eq!(parsed, result);
        assert!(report.warnings.is_empty());
    }
}
