// Main entry point for the SCM sync control plane.
//
// Boots the pool with the tenant search_path, runs migrations, then
// spawns the worker fleet, the reaper, the scheduler and the
// health/metrics HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use engram_core::artifacts::LocalArtifactsStore;
use engram_core::server::build_app;
use engram_core::store::{connect_pool, SchemaContext};
use engram_core::sync::{
    default_executor, CircuitBreaker, RateLimiter, Reaper, ReaperConfig, Scheduler,
    SchedulerConfig, SyncDeps, SyncQueue, SyncWorker, SyncWorkerConfig,
};
use engram_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,engram_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting engram scm sync control plane");

    let config = Arc::new(Config::load(None).context("failed to load configuration")?);
    let dsn = config
        .dsn()
        .context("no postgres dsn configured ([postgres].dsn or ENGRAM_PG_DSN)")?
        .to_string();

    let schema_context = SchemaContext::new(config.postgres.schema_prefix.clone())?;
    let pool = connect_pool(
        &dsn,
        &schema_context,
        config.postgres.max_connections.unwrap_or(10),
    )
    .await
    .context("failed to connect to database")?;
    tracing::info!(search_path = %schema_context.search_path(), "database connected");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("migrations complete");

    let sync = &config.sync;
    let queue = SyncQueue::new(
        pool.clone(),
        sync.retry_base_seconds,
        sync.retry_max_seconds,
        sync.lease_seconds,
    );
    let limiter = RateLimiter::new(pool.clone(), sync.rate_limit_rate, sync.rate_limit_burst);
    let breaker = CircuitBreaker::new(
        pool.clone(),
        sync.breaker_failure_threshold,
        sync.breaker_open_base_seconds,
        sync.breaker_open_max_seconds,
        sync.breaker_half_open_success_quota,
    );
    let artifacts = Arc::new(LocalArtifactsStore::new(config.artifacts.root.clone()));
    let deps = Arc::new(SyncDeps::new(pool.clone(), config.clone(), artifacts));
    let executor = Arc::new(default_executor());

    // Worker fleet: one sequential loop per configured slot.
    let mut tasks = Vec::new();
    for slot in 0..sync.worker_concurrency {
        let worker_config = SyncWorkerConfig {
            heartbeat_interval: Duration::from_secs(sync.heartbeat_interval_seconds),
            handler_timeout: Duration::from_secs(sync.handler_timeout_seconds),
            limiter_wait_max: Duration::from_secs(sync.limiter_wait_max_seconds),
            lease_seconds: sync.lease_seconds,
            ..SyncWorkerConfig::with_worker_id(format!("worker-{slot}"))
        };
        let worker = SyncWorker::new(
            queue.clone(),
            executor.clone(),
            deps.clone(),
            limiter.clone(),
            breaker.clone(),
            worker_config,
        );
        tasks.push(tokio::spawn(worker.run()));
    }

    let reaper = Reaper::new(
        pool.clone(),
        queue.clone(),
        ReaperConfig {
            interval: Duration::from_secs(sync.reaper_interval_seconds),
            stale_grace_seconds: sync.reaper_stale_grace_seconds,
            auto_fix: true,
        },
    );
    tasks.push(tokio::spawn(reaper.run()));

    let scheduler = Scheduler::new(
        pool.clone(),
        queue.clone(),
        breaker.clone(),
        SchedulerConfig {
            interval: Duration::from_secs(sync.scheduler_interval_seconds),
            cursor_max_age_seconds: sync.cursor_max_age_seconds,
            probe_budget: sync.probe_budget,
            project_key: config.project_key().to_string(),
        },
    );
    tasks.push(tokio::spawn(scheduler.run()));

    let app = build_app(pool);
    let addr = config.server.listen_addr.clone();
    tracing::info!(%addr, "metrics surface listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind listen address")?;

    tokio::select! {
        served = axum::serve(listener, app) => {
            served.context("http server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    for task in tasks {
        task.abort();
    }
    Ok(())
}
