//! Per-(project, scope) circuit breaker backed by the health KV.
//!
//! Three states: `closed` counts consecutive failures and opens at the
//! threshold; `open` rejects everything until `open_until`, then lets the
//! next check through as a half-open probe; `half_open` admits a bounded
//! number of probes and closes after a success quota or re-opens (with a
//! doubled window) on any failure. State transitions publish suggested
//! degradations that the scheduler embeds into the next job payload.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;

use crate::store::kv::{kv_get_for_update, kv_set_in_tx};
use crate::store::{StoreResult, NAMESPACE_SYNC_HEALTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric gauge value for the metrics surface.
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// Persisted breaker record (`scm.sync_health` namespace).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: i64,
    pub success_count: i64,
    pub last_transition_at: Option<String>,
    pub open_until: Option<String>,
    pub open_duration_seconds: i64,
    pub probe_inflight: i64,
}

impl BreakerSnapshot {
    fn from_value(value: Option<Value>) -> BreakerSnapshot {
        value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn open_until_ts(&self) -> Option<DateTime<Utc>> {
        self.open_until
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Degradation hints published on open/half-open transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub suggested_batch_size: i64,
    pub suggested_forward_window_seconds: i64,
    pub suggested_diff_mode: String,
}

impl Default for Degradation {
    fn default() -> Self {
        Degradation {
            suggested_batch_size: 50,
            suggested_forward_window_seconds: 3600,
            suggested_diff_mode: "none".to_string(),
        }
    }
}

/// Outcome of a dispatch check.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerDecision {
    /// Closed: dispatch normally.
    Allow,
    /// Half-open: dispatch as a probe with reduced budgets.
    Probe,
    /// Open: reject with `error_category=circuit_open`.
    Reject { open_until: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pool: PgPool,
    failure_threshold: i64,
    open_base_seconds: i64,
    open_max_seconds: i64,
    half_open_success_quota: i64,
    /// Concurrent probes admitted while half-open.
    half_open_max_probes: i64,
}

impl CircuitBreaker {
    pub fn new(
        pool: PgPool,
        failure_threshold: i64,
        open_base_seconds: i64,
        open_max_seconds: i64,
        half_open_success_quota: i64,
    ) -> Self {
        Self {
            pool,
            failure_threshold,
            open_base_seconds,
            open_max_seconds,
            half_open_success_quota,
            half_open_max_probes: 1,
        }
    }

    pub async fn snapshot(&self, key: &str) -> StoreResult<BreakerSnapshot> {
        let value = crate::store::kv::kv_get(&self.pool, NAMESPACE_SYNC_HEALTH, key).await?;
        Ok(BreakerSnapshot::from_value(value))
    }

    /// Gate one dispatch attempt.
    pub async fn check(&self, key: &str) -> StoreResult<BreakerDecision> {
        let mut tx = self.pool.begin().await?;
        let mut snap =
            BreakerSnapshot::from_value(kv_get_for_update(&mut *tx, NAMESPACE_SYNC_HEALTH, key).await?);
        let now = Utc::now();

        let decision = match snap.state {
            CircuitState::Closed => BreakerDecision::Allow,
            CircuitState::Open => {
                let expired = snap
                    .open_until_ts()
                    .map(|until| now >= until)
                    .unwrap_or(true);
                if expired {
                    snap.state = CircuitState::HalfOpen;
                    snap.success_count = 0;
                    snap.probe_inflight = 1;
                    snap.last_transition_at = Some(now.to_rfc3339());
                    info!(key, "circuit breaker open -> half_open");
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Reject {
                        open_until: snap.open_until_ts(),
                    }
                }
            }
            CircuitState::HalfOpen => {
                if snap.probe_inflight < self.half_open_max_probes {
                    snap.probe_inflight += 1;
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Reject {
                        open_until: snap.open_until_ts(),
                    }
                }
            }
        };

        self.save(&mut tx, key, &snap).await?;
        tx.commit().await?;
        Ok(decision)
    }

    /// Record a successful dispatch.
    pub async fn record_success(&self, key: &str) -> StoreResult<CircuitState> {
        let mut tx = self.pool.begin().await?;
        let mut snap =
            BreakerSnapshot::from_value(kv_get_for_update(&mut *tx, NAMESPACE_SYNC_HEALTH, key).await?);
        let now = Utc::now();

        match snap.state {
            CircuitState::Closed => {
                snap.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                snap.success_count += 1;
                snap.probe_inflight = (snap.probe_inflight - 1).max(0);
                if snap.success_count >= self.half_open_success_quota {
                    snap.state = CircuitState::Closed;
                    snap.failure_count = 0;
                    snap.success_count = 0;
                    snap.open_duration_seconds = 0;
                    snap.open_until = None;
                    snap.last_transition_at = Some(now.to_rfc3339());
                    info!(key, "circuit breaker half_open -> closed");
                }
            }
            // A straggler finishing after the window reopened; ignore.
            CircuitState::Open => {}
        }

        let state = snap.state;
        self.save(&mut tx, key, &snap).await?;
        tx.commit().await?;
        Ok(state)
    }

    /// Record a failed dispatch. Returns the degradation suggestion when
    /// this failure (re)opened the circuit.
    pub async fn record_failure(&self, key: &str) -> StoreResult<Option<Degradation>> {
        let mut tx = self.pool.begin().await?;
        let mut snap =
            BreakerSnapshot::from_value(kv_get_for_update(&mut *tx, NAMESPACE_SYNC_HEALTH, key).await?);
        let now = Utc::now();

        let opened = match snap.state {
            CircuitState::Closed => {
                snap.failure_count += 1;
                if snap.failure_count >= self.failure_threshold {
                    self.open(&mut snap, now, self.open_base_seconds);
                    info!(key, "circuit breaker closed -> open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                let doubled = (snap.open_duration_seconds.max(self.open_base_seconds) * 2)
                    .min(self.open_max_seconds);
                self.open(&mut snap, now, doubled);
                info!(key, open_seconds = doubled, "circuit breaker half_open -> open");
                true
            }
            CircuitState::Open => {
                snap.failure_count += 1;
                false
            }
        };

        self.save(&mut tx, key, &snap).await?;
        tx.commit().await?;
        Ok(opened.then(Degradation::default))
    }

    fn open(&self, snap: &mut BreakerSnapshot, now: DateTime<Utc>, duration_seconds: i64) {
        snap.state = CircuitState::Open;
        snap.open_duration_seconds = duration_seconds;
        snap.open_until = Some((now + Duration::seconds(duration_seconds)).to_rfc3339());
        snap.last_transition_at = Some(now.to_rfc3339());
        snap.success_count = 0;
        snap.probe_inflight = 0;
    }

    async fn save(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        key: &str,
        snap: &BreakerSnapshot,
    ) -> StoreResult<()> {
        let value = serde_json::to_value(snap).unwrap_or(Value::Null);
        kv_set_in_tx(&mut *tx, NAMESPACE_SYNC_HEALTH, key, &value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_defaults_to_closed() {
        let snap = BreakerSnapshot::from_value(None);
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[test]
    fn snapshot_parses_partial_records() {
        let snap = BreakerSnapshot::from_value(Some(serde_json::json!({
            "state": "open",
            "failure_count": 7,
        })));
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.failure_count, 7);
        assert_eq!(snap.open_duration_seconds, 0);
    }

    #[test]
    fn state_gauge_values_are_ordered() {
        assert_eq!(CircuitState::Closed.as_gauge(), 0);
        assert_eq!(CircuitState::HalfOpen.as_gauge(), 1);
        assert_eq!(CircuitState::Open.as_gauge(), 2);
    }

    #[test]
    fn default_degradation_matches_published_hints() {
        let hints = Degradation::default();
        assert_eq!(hints.suggested_batch_size, 50);
        assert_eq!(hints.suggested_forward_window_seconds, 3600);
        assert_eq!(hints.suggested_diff_mode, "none");
    }
}
