use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;
use tracing::warn;

use crate::{app_state::AppState, services::task_pool::PoolState};

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

async fn healthz() -> impl IntoResponse {
    metrics::counter!("health_checks_total", "endpoint" => "healthz", "status" => "ok")
        .increment(1);
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (code, status) = if state.tasks.state() != PoolState::Running {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else if let Err(err) = state.repository.ping().await {
        warn!(error = %err, "readiness probe failed");
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ready")
    };

    let outcome = if code.is_success() { "ok" } else { "error" };
    metrics::counter!("health_checks_total", "endpoint" => "readyz", "status" => outcome)
        .increment(1);
    (code, Json(HealthResponse { status }))
}

/// Liveness and readiness probes.
pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
