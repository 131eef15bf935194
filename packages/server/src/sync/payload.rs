//! The v2 sync-job payload and its schema contract.
//!
//! `sync_jobs.payload_json` must validate against
//! `schemas/scm_sync_job_payload_v2.schema.json` (shipped with the binary
//! and embedded here). Unknown fields are allowed and preserved so
//! schedulers can attach extra hints without a schema bump.

use std::sync::OnceLock;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Embedded contract schema, also shipped at `schemas/`.
pub const JOB_PAYLOAD_SCHEMA_JSON: &str =
    include_str!("../../schemas/scm_sync_job_payload_v2.schema.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Time,
    Rev,
    /// Legacy spelling of `rev`, still accepted.
    Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Incremental,
    Backfill,
    Probe,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Backfill => "backfill",
            SyncMode::Probe => "probe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    Always,
    #[default]
    BestEffort,
    Minimal,
    None,
}

impl DiffMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffMode::Always => "always",
            DiffMode::BestEffort => "best_effort",
            DiffMode::Minimal => "minimal",
            DiffMode::None => "none",
        }
    }
}

/// Typed view of `payload_json`. All fields optional; extra fields ride in
/// `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_type: Option<WindowType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_rev: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_rev: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<SyncMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_mode: Option<DiffMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_watermark: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gitlab_instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_files_per_commit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_budget: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_backfill_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_batch_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_forward_window_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_diff_mode: Option<DiffMode>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobPayload {
    pub fn v2() -> Self {
        JobPayload {
            version: Some("v2".to_string()),
            ..Default::default()
        }
    }

    /// Diff mode with the breaker suggestion as fallback.
    pub fn effective_diff_mode(&self) -> DiffMode {
        self.diff_mode
            .or(self.suggested_diff_mode)
            .unwrap_or_default()
    }

    /// Batch size with the breaker suggestion as fallback.
    pub fn effective_batch_size(&self, default: i64) -> i64 {
        self.batch_size
            .or(self.suggested_batch_size)
            .unwrap_or(default)
            .max(1)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    pub fn from_value(value: &Value) -> Result<Self, PayloadValidationError> {
        validate_job_payload(value)?;
        serde_json::from_value(value.clone())
            .map_err(|e| PayloadValidationError::Shape(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum PayloadValidationError {
    #[error("payload does not match scm_sync_job_payload_v2: {0}")]
    Schema(String),
    #[error("payload shape error: {0}")]
    Shape(String),
}

fn compiled_schema() -> &'static JSONSchema {
    static SCHEMA: OnceLock<JSONSchema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        let raw: Value = serde_json::from_str(JOB_PAYLOAD_SCHEMA_JSON)
            .expect("embedded payload schema is valid JSON");
        JSONSchema::compile(&raw).expect("embedded payload schema compiles")
    })
}

/// Validate a raw payload against the v2 schema.
pub fn validate_job_payload(payload: &Value) -> Result<(), PayloadValidationError> {
    let schema = compiled_schema();
    let outcome = schema.validate(payload);
    if let Err(errors) = outcome {
        let detail = errors
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(PayloadValidationError::Schema(detail));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn incremental_payload_passes() {
        let payload = json!({
            "version": "v2",
            "gitlab_instance": "gitlab.example.com",
            "mode": "incremental",
            "diff_mode": "best_effort",
            "strict": false,
            "update_watermark": true,
        });
        validate_job_payload(&payload).unwrap();
    }

    #[test]
    fn time_window_payload_passes() {
        let payload = json!({
            "version": "v2",
            "window_type": "time",
            "since": "2024-01-01T00:00:00Z",
            "until": "2024-01-02T00:00:00Z",
            "mode": "backfill",
            "update_watermark": true,
        });
        validate_job_payload(&payload).unwrap();
    }

    #[test]
    fn revision_window_payload_passes() {
        let payload = json!({
            "version": "v2",
            "window_type": "rev",
            "start_rev": 1000,
            "end_rev": 1100,
            "mode": "backfill",
        });
        validate_job_payload(&payload).unwrap();
    }

    #[test]
    fn degradation_payload_passes() {
        let payload = json!({
            "version": "v2",
            "gitlab_instance": "gitlab.example.com",
            "mode": "probe",
            "diff_mode": "none",
            "is_backfill_only": true,
            "circuit_state": "half_open",
            "suggested_batch_size": 50,
            "suggested_forward_window_seconds": 3600,
            "suggested_diff_mode": "none",
        });
        validate_job_payload(&payload).unwrap();
    }

    #[test]
    fn minimal_and_empty_payloads_pass() {
        validate_job_payload(&json!({"version": "v2"})).unwrap();
        validate_job_payload(&json!({})).unwrap();
    }

    #[test]
    fn unknown_fields_are_allowed() {
        validate_job_payload(&json!({"version": "v2", "operator_note": "manual kick"})).unwrap();
    }

    #[test]
    fn invalid_enum_values_fail() {
        assert!(validate_job_payload(&json!({"version": "v1"})).is_err());
        assert!(validate_job_payload(&json!({"window_type": "bogus"})).is_err());
        assert!(validate_job_payload(&json!({"mode": "bogus"})).is_err());
        assert!(validate_job_payload(&json!({"diff_mode": "bogus"})).is_err());
    }

    #[test]
    fn negative_rev_fails() {
        assert!(validate_job_payload(&json!({"start_rev": -1})).is_err());
    }

    #[test]
    fn schema_examples_validate() {
        let raw: Value = serde_json::from_str(JOB_PAYLOAD_SCHEMA_JSON).unwrap();
        for example in raw["examples"].as_array().unwrap() {
            validate_job_payload(example).unwrap();
        }
    }

    #[test]
    fn typed_payload_round_trips_with_extras() {
        let mut payload = JobPayload::v2();
        payload.gitlab_instance = Some("gitlab.example.com".into());
        payload.mode = Some(SyncMode::Incremental);
        payload
            .extra
            .insert("operator_note".into(), json!("manual kick"));

        let value = payload.to_value();
        let parsed = JobPayload::from_value(&value).unwrap();
        assert_eq!(parsed, payload);
        assert_eq!(parsed.extra["operator_note"], "manual kick");
    }

    #[test]
    fn suggestions_act_as_fallbacks() {
        let mut payload = JobPayload::v2();
        payload.suggested_diff_mode = Some(DiffMode::None);
        payload.suggested_batch_size = Some(50);
        assert_eq!(payload.effective_diff_mode(), DiffMode::None);
        assert_eq!(payload.effective_batch_size(200), 50);

        payload.diff_mode = Some(DiffMode::Always);
        payload.batch_size = Some(25);
        assert_eq!(payload.effective_diff_mode(), DiffMode::Always);
        assert_eq!(payload.effective_batch_size(200), 25);
    }
}
