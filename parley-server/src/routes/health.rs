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

use crate::app_state::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failing: Vec<&'static str>,
    connections: usize,
}

async fn healthz() -> impl IntoResponse {
    metrics::counter!("parley_health_checks_total", "endpoint" => "healthz", "status" => "ok")
        .increment(1);
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// Ready when the store answers, the cache answers and cross-instance
/// delivery is healthy.
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut failing = Vec::new();
    if let Err(err) = state.store.ping().await {
        warn!(error = %err, "readiness: store unavailable");
        failing.push("store");
    }
    if let Err(err) = state.store.cache().ping().await {
        warn!(error = %err, "readiness: cache unavailable");
        failing.push("cache");
    }
    if !state.store.fabric().is_healthy() {
        warn!("readiness: fan-out fabric degraded");
        failing.push("fabric");
    }

    let ready = failing.is_empty();
    let label = if ready { "ok" } else { "error" };
    metrics::counter!("parley_health_checks_total", "endpoint" => "readyz", "status" => label)
        .increment(1);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        failing,
        connections: state.hub.connection_count().await,
    };
    (status, Json(body))
}

pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
