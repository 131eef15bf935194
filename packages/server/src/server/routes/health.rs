use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: DatabaseHealth,
    connection_pool: ConnectionPoolHealth,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectionPoolHealth {
    size: u32,
    idle_connections: usize,
}

/// Health check endpoint.
///
/// Returns 200 OK when the database answers within 5 seconds, 503
/// otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(&state.db_pool),
    )
    .await
    {
        Ok(Ok(_)) => DatabaseHealth {
            status: "ok".to_string(),
            error: None,
        },
        Ok(Err(e)) => DatabaseHealth {
            status: "error".to_string(),
            error: Some(format!("query failed: {e}")),
        },
        Err(_) => DatabaseHealth {
            status: "error".to_string(),
            error: Some("query timeout (>5s)".to_string()),
        },
    };

    let connection_pool = ConnectionPoolHealth {
        size: state.db_pool.size(),
        idle_connections: state.db_pool.num_idle(),
    };

    let healthy = database.status == "ok";
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        database,
        connection_pool,
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
