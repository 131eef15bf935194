//! Axum application wiring for the observation surface.

use axum::routing::get;
use axum::{Extension, Router};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use super::routes;

#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
}

/// Build the router: `/health` for liveness, `/metrics` for Prometheus.
pub fn build_app(pool: PgPool) -> Router {
    let state = AppState { db_pool: pool };

    Router::new()
        .route("/health", get(routes::health::health_handler))
        .route("/metrics", get(routes::metrics::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}
