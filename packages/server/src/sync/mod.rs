//! The SCM sync control plane.
//!
//! Leaves first: key normalization, cursors, the result envelope and the
//! counts/payload contracts; then the limiter and breaker, the durable
//! queue, the executor registry with its handlers, and finally the
//! worker, reaper and scheduler loops that tie them together.

pub mod audit;
pub mod breaker;
pub mod counts;
pub mod cursor;
pub mod drift;
pub mod executor;
pub mod handlers;
pub mod keys;
pub mod limiter;
pub mod payload;
pub mod queue;
pub mod reaper;
pub mod result;
pub mod scheduler;
pub mod worker;

pub use breaker::{BreakerDecision, CircuitBreaker, CircuitState, Degradation};
pub use executor::{default_executor, SharedSyncExecutor, SyncDeps, SyncExecutor};
pub use keys::{
    build_circuit_breaker_key, extract_instance_and_tenant, extract_instance_key,
    extract_tenant_id, normalize_instance_key, BreakerScope,
};
pub use limiter::{AcquireOutcome, RateLimiter};
pub use payload::{DiffMode, JobPayload, SyncMode};
pub use queue::{EnqueueOutcome, FailOutcome, JobStatus, SyncJob, SyncLockRow, SyncQueue};
pub use reaper::{ReapReport, Reaper, ReaperConfig};
pub use result::{ErrorCategory, SyncResult};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use worker::{SyncWorker, SyncWorkerConfig};
