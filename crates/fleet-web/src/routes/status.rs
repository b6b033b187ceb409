//! Fleet-level read endpoints: GET /health, GET /status, GET /metrics

use axum::{extract::State, response::Json};
use fleet_orchestrator::{FleetMetrics, StatusView};
use serde::Serialize;

use crate::state::{AppState, WebhookCounters};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    workers: usize,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let workers = state.fleet.supervisor().counts().await.total;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        workers,
    })
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<StatusView> {
    Json(state.fleet.status().await)
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    fleet: FleetMetrics,
    webhook: WebhookCounters,
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        fleet: state.fleet.metrics().await,
        webhook: state.webhook.snapshot(),
    })
}
