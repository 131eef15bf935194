//! End-to-end worker flows over the real queue, breaker, limiter and
//! run store, with scripted handlers standing in for the SCM clients.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_pool, test_queue, test_repo, unique_job_type};
use engram_core::artifacts::LocalArtifactsStore;
use engram_core::store::{PatchBlob, RepoType, RunStatus, SyncRun};
use engram_core::sync::{
    CircuitBreaker, CircuitState, ErrorCategory, JobStatus, RateLimiter, Scheduler,
    SchedulerConfig, SyncDeps, SyncExecutor, SyncMode, SyncQueue, SyncResult, SyncWorker,
    SyncWorkerConfig,
};
use engram_core::Config;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

fn flow_payload(instance: &str) -> serde_json::Value {
    json!({
        "version": "v2",
        "gitlab_instance": instance,
        "mode": "incremental",
        "diff_mode": "best_effort",
        "update_watermark": true,
    })
}

fn unique_instance() -> String {
    format!("{}.example.com", Uuid::new_v4().simple())
}

fn make_deps(pool: &PgPool) -> Arc<SyncDeps> {
    let root = std::env::temp_dir().join(format!("engram-flow-{}", Uuid::new_v4()));
    Arc::new(SyncDeps::new(
        pool.clone(),
        Arc::new(Config::default()),
        Arc::new(LocalArtifactsStore::new(root)),
    ))
}

fn make_worker(
    pool: &PgPool,
    queue: &SyncQueue,
    executor: SyncExecutor,
    deps: &Arc<SyncDeps>,
    worker_id: &str,
) -> SyncWorker {
    let limiter = RateLimiter::new(pool.clone(), 100.0, 100.0);
    let breaker = CircuitBreaker::new(pool.clone(), 5, 60, 3600, 2);
    let config = SyncWorkerConfig {
        handler_timeout: Duration::from_secs(30),
        limiter_wait_max: Duration::from_secs(5),
        ..SyncWorkerConfig::with_worker_id(worker_id)
    };
    SyncWorker::new(
        queue.clone(),
        Arc::new(executor),
        deps.clone(),
        limiter,
        breaker,
        config,
    )
}

#[tokio::test]
async fn happy_path_completes_job_run_cursor_and_blobs() {
    let pool = test_pool().await;
    let queue = test_queue(&pool);
    let repo = test_repo(&pool, RepoType::Gitlab).await;
    let deps = make_deps(&pool);
    let job_type = unique_job_type("happy");
    let instance = unique_instance();

    // Scripted handler: writes ten patch-blob rows, reports the batch.
    let source_marker = job_type.clone();
    let mut executor = SyncExecutor::new();
    {
        let job_type: &'static str = Box::leak(job_type.clone().into_boxed_str());
        executor.register(job_type, move |deps: Arc<SyncDeps>, repo, _mode, _payload| {
            let marker = source_marker.clone();
            async move {
                let mut result = SyncResult::default();
                result.synced_count = 10;
                for i in 0..10 {
                    let sha256 = format!("{:064x}", i + 1);
                    let ext = if i < 8 { "diff" } else { "ministat" };
                    PatchBlob::upsert(
                        &deps.pool,
                        &marker,
                        &format!("{}:{i}", repo.repo_id),
                        &sha256,
                        &format!("file:///tmp/{sha256}.{ext}"),
                        ext,
                        128,
                    )
                    .await?;
                    if i < 8 {
                        result.record_diff_success();
                    } else {
                        result.record_diff_degraded("timeout");
                    }
                }
                result.cursor_after =
                    Some(json!({"sha": "abc123", "ts": "2024-01-15T12:00:00Z"}));
                result.watermark_updated = true;
                Ok(result)
            }
        });
    }

    queue
        .enqueue(
            repo.repo_id,
            &job_type,
            SyncMode::Incremental,
            &flow_payload(&instance),
            None,
            None,
        )
        .await
        .unwrap();

    let worker = make_worker(&pool, &queue, executor, &deps, "w-happy");
    let types = vec![job_type.clone()];
    let job = queue
        .claim_one("w-happy", Some(&types), None, 300)
        .await
        .unwrap()
        .unwrap();
    worker.process_job(job.clone()).await;

    let finished = queue.find_by_id(job.job_id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    let run_id = finished.last_run_id.expect("run linked");

    let run = SyncRun::find_by_id(&pool, run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let counts = run.counts.expect("counts stored");
    assert_eq!(counts["synced_count"], 10);
    assert_eq!(counts["diff_count"], 10);
    assert_eq!(counts["degraded_count"], 2);
    assert_eq!(run.cursor_after.unwrap()["sha"], "abc123");
    assert!(run.logbook_item_id.is_some());

    let blobs = PatchBlob::count_for_source(&pool, &job_type).await.unwrap();
    assert_eq!(blobs, 10);
}

#[tokio::test]
async fn contract_violation_rewrites_to_contract_error_and_dead() {
    let pool = test_pool().await;
    let queue = test_queue(&pool);
    let repo = test_repo(&pool, RepoType::Gitlab).await;
    let deps = make_deps(&pool);
    let job_type = unique_job_type("contract");
    let instance = unique_instance();

    let mut executor = SyncExecutor::new();
    {
        let job_type: &'static str = Box::leak(job_type.clone().into_boxed_str());
        executor.register(job_type, |_deps, _repo, _mode, _payload| async move {
            let mut result = SyncResult::default();
            result.synced_count = -1; // violates the contract
            Ok(result)
        });
    }

    queue
        .enqueue(
            repo.repo_id,
            &job_type,
            SyncMode::Incremental,
            &flow_payload(&instance),
            None,
            None,
        )
        .await
        .unwrap();

    let worker = make_worker(&pool, &queue, executor, &deps, "w-contract");
    let types = vec![job_type.clone()];
    let job = queue
        .claim_one("w-contract", Some(&types), None, 300)
        .await
        .unwrap()
        .unwrap();
    worker.process_job(job.clone()).await;

    let finished = queue.find_by_id(job.job_id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Dead);
    assert!(finished.last_error.unwrap().contains("contract_error"));
}

#[tokio::test]
async fn unknown_job_type_goes_dead() {
    let pool = test_pool().await;
    let queue = test_queue(&pool);
    let repo = test_repo(&pool, RepoType::Gitlab).await;
    let deps = make_deps(&pool);
    let job_type = unique_job_type("unknown");
    let instance = unique_instance();

    queue
        .enqueue(
            repo.repo_id,
            &job_type,
            SyncMode::Incremental,
            &flow_payload(&instance),
            None,
            None,
        )
        .await
        .unwrap();

    let worker = make_worker(&pool, &queue, SyncExecutor::new(), &deps, "w-unknown");
    let types = vec![job_type.clone()];
    let job = queue
        .claim_one("w-unknown", Some(&types), None, 300)
        .await
        .unwrap()
        .unwrap();
    worker.process_job(job.clone()).await;

    let finished = queue.find_by_id(job.job_id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Dead);
    assert!(finished.last_error.unwrap().contains("unknown_job_type"));
}

#[tokio::test]
async fn rate_limit_storm_opens_breaker_then_probe_recovers() {
    let pool = test_pool().await;
    let queue = test_queue(&pool);
    let repo = test_repo(&pool, RepoType::Gitlab).await;
    let deps = make_deps(&pool);
    let job_type = unique_job_type("storm");
    let instance = unique_instance();

    let mut executor = SyncExecutor::new();
    {
        let job_type: &'static str = Box::leak(job_type.clone().into_boxed_str());
        executor.register(job_type, |_deps, _repo, _mode, _payload| async move {
            Ok(SyncResult::for_error(
                "429 too many requests",
                ErrorCategory::RateLimit,
            ))
        });
    }

    let worker = make_worker(&pool, &queue, executor, &deps, "w-storm");
    let breaker = CircuitBreaker::new(pool.clone(), 5, 60, 3600, 2);
    let breaker_key = format!(
        "{}:instance:{}",
        repo.project_key.as_deref().unwrap(),
        instance
    );

    queue
        .enqueue(
            repo.repo_id,
            &job_type,
            SyncMode::Incremental,
            &flow_payload(&instance),
            None,
            None,
        )
        .await
        .unwrap();

    let types = vec![job_type.clone()];
    for _ in 0..5 {
        // Clear retry backoff and the limiter pause left by the last 429.
        sqlx::query("UPDATE sync_jobs SET not_before = now() WHERE repo_id = $1 AND job_type = $2")
            .bind(repo.repo_id)
            .bind(&job_type)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE rate_limit_buckets SET paused_until = NULL WHERE instance_key = $1")
            .bind(&instance)
            .execute(&pool)
            .await
            .unwrap();

        let job = queue
            .claim_one("w-storm", Some(&types), None, 300)
            .await
            .unwrap()
            .expect("job claimable");
        worker.process_job(job).await;
    }

    let snapshot = breaker.snapshot(&breaker_key).await.unwrap();
    assert_eq!(snapshot.state, CircuitState::Open);

    // Window expiry: the next check admits a single probe.
    let past = (chrono::Utc::now() - chrono::Duration::seconds(1)).to_rfc3339();
    sqlx::query(
        r#"
        UPDATE kv
        SET value_json = jsonb_set(value_json, '{open_until}', to_jsonb($2::text))
        WHERE namespace = 'scm.sync_health' AND key = $1
        "#,
    )
    .bind(&breaker_key)
    .bind(&past)
    .execute(&pool)
    .await
    .unwrap();

    use engram_core::sync::BreakerDecision;
    let decision = breaker.check(&breaker_key).await.unwrap();
    assert_eq!(decision, BreakerDecision::Probe);
    let snapshot = breaker.snapshot(&breaker_key).await.unwrap();
    assert_eq!(snapshot.state, CircuitState::HalfOpen);

    // Two probe successes close the circuit.
    breaker.record_success(&breaker_key).await.unwrap();
    assert_eq!(
        breaker.snapshot(&breaker_key).await.unwrap().state,
        CircuitState::HalfOpen
    );
    breaker.record_success(&breaker_key).await.unwrap();
    assert_eq!(
        breaker.snapshot(&breaker_key).await.unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn scheduler_skips_open_and_probes_half_open() {
    let pool = test_pool().await;
    let queue = test_queue(&pool);
    let breaker = CircuitBreaker::new(pool.clone(), 5, 60, 3600, 2);
    let deps_host = format!("{}.sched.example.com", Uuid::new_v4().simple());

    // A repo on its own instance so its breaker key is private to this test.
    let repo = engram_core::store::Repo::upsert(
        &pool,
        RepoType::Svn,
        &format!("https://{deps_host}/svn/proj"),
        Some("sched/proj"),
        None,
    )
    .await
    .unwrap();
    let breaker_key = format!("sched/proj:instance:{deps_host}");

    let scheduler = Scheduler::new(
        pool.clone(),
        queue.clone(),
        breaker.clone(),
        SchedulerConfig {
            interval: Duration::from_secs(3600),
            cursor_max_age_seconds: 0,
            probe_budget: 10,
            project_key: "sched/proj".to_string(),
        },
    );

    // Open circuit: nothing is enqueued for this repo.
    sqlx::query(
        r#"
        INSERT INTO kv (namespace, key, value_json)
        VALUES ('scm.sync_health', $1, $2)
        ON CONFLICT (namespace, key) DO UPDATE SET value_json = EXCLUDED.value_json
        "#,
    )
    .bind(&breaker_key)
    .bind(json!({
        "state": "open",
        "failure_count": 5,
        "open_until": (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
    }))
    .execute(&pool)
    .await
    .unwrap();

    scheduler.tick().await.unwrap();
    assert!(!queue.has_pending(repo.repo_id, "svn").await.unwrap());

    // Half-open circuit: one probe job with degraded budgets.
    sqlx::query(
        "UPDATE kv SET value_json = jsonb_set(value_json, '{state}', '\"half_open\"') \
         WHERE namespace = 'scm.sync_health' AND key = $1",
    )
    .bind(&breaker_key)
    .execute(&pool)
    .await
    .unwrap();

    scheduler.tick().await.unwrap();
    let jobs = sqlx::query_as::<_, (String, serde_json::Value)>(
        "SELECT mode, payload_json FROM sync_jobs WHERE repo_id = $1 AND job_type = 'svn' AND status = 'pending'",
    )
    .bind(repo.repo_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(jobs.len(), 1);
    let (mode, payload) = &jobs[0];
    assert_eq!(mode, "probe");
    assert_eq!(payload["circuit_state"], "half_open");
    assert_eq!(payload["suggested_batch_size"], 50);
    assert_eq!(payload["suggested_diff_mode"], "none");

    // Debounce: a second tick does not add another job.
    scheduler.tick().await.unwrap();
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sync_jobs WHERE repo_id = $1 AND job_type = 'svn' AND status = 'pending'",
    )
    .bind(repo.repo_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);
}
