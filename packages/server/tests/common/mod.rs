//! Shared integration-test infrastructure.
//!
//! One Postgres container is started for the whole test binary and
//! migrations run once; each test gets its own pool. Tests isolate
//! themselves by using per-test repos (unique urls) and per-test job
//! types, since the job tables are shared.

use engram_core::store::{connect_pool, Repo, RepoType, SchemaContext};
use engram_core::sync::SyncQueue;
use serde_json::json;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

pub struct SharedInfra {
    pub dsn: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED: OnceCell<SharedInfra> = OnceCell::const_new();

impl SharedInfra {
    async fn init() -> SharedInfra {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .expect("failed to start postgres container");

        let host = postgres.get_host().await.expect("container host");
        let port = postgres
            .get_host_port_ipv4(5432)
            .await
            .expect("container port");
        let dsn = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&dsn)
            .await
            .expect("failed to connect for migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations failed");

        SharedInfra {
            dsn,
            _postgres: postgres,
        }
    }

    pub async fn get() -> &'static SharedInfra {
        SHARED.get_or_init(Self::init).await
    }
}

/// A fresh pool with the default (unprefixed) schema context.
pub async fn test_pool() -> PgPool {
    let infra = SharedInfra::get().await;
    connect_pool(&infra.dsn, &SchemaContext::default(), 5)
        .await
        .expect("failed to open test pool")
}

/// A queue with fast retries so backoff assertions stay cheap.
pub fn test_queue(pool: &PgPool) -> SyncQueue {
    SyncQueue::new(pool.clone(), 1, 60, 300)
}

/// Register a repo with a unique url so tests do not collide.
pub async fn test_repo(pool: &PgPool, repo_type: RepoType) -> Repo {
    let url = format!(
        "https://gitlab.example.com/t/{}",
        Uuid::new_v4().simple()
    );
    Repo::upsert(pool, repo_type, &url, Some("acme/logbook"), Some("main"))
        .await
        .expect("repo upsert failed")
}

/// A unique job type per test keeps claim loops from stealing each
/// other's rows.
pub fn unique_job_type(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

pub fn v2_payload() -> serde_json::Value {
    json!({
        "version": "v2",
        "gitlab_instance": "gitlab.example.com",
        "mode": "incremental",
        "diff_mode": "best_effort",
        "update_watermark": true,
    })
}
