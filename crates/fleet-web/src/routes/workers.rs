//! Worker endpoints under /workers

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use fleet_core::BotId;
use fleet_orchestrator::registry::LogLine;
use fleet_orchestrator::scanner::{BotProcesses, ScanReport};
use fleet_orchestrator::supervisor::{CleanupReport, RestartAllReport, StopReport};
use fleet_orchestrator::views::RestartsView;
use fleet_orchestrator::{SyncSummary, WorkerDetail, WorkerView};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::state::{AppState, parse_bot_id};

const DEFAULT_LOG_LINES: usize = 100;

#[derive(Debug, Serialize)]
pub struct WorkerList {
    workers: Vec<WorkerView>,
    total: usize,
}

/// GET /workers
pub async fn list_workers(State(state): State<AppState>) -> Json<WorkerList> {
    let workers = state.fleet.supervisor().worker_views().await;
    Json(WorkerList {
        total: workers.len(),
        workers,
    })
}

/// GET /workers/{id}
pub async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkerView>> {
    let bot_id = parse_bot_id(&id)?;
    Ok(Json(state.fleet.supervisor().worker_view(bot_id).await?))
}

/// GET /workers/{id}/detailed
pub async fn detailed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkerDetail>> {
    let bot_id = parse_bot_id(&id)?;
    Ok(Json(state.fleet.supervisor().worker_detail(bot_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    lines: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    bot_id: BotId,
    lines: Vec<LogLine>,
}

/// GET /workers/{id}/logs?lines=N
pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>> {
    let bot_id = parse_bot_id(&id)?;
    let lines = state
        .fleet
        .supervisor()
        .logs(bot_id, query.lines.unwrap_or(DEFAULT_LOG_LINES))
        .await?;
    Ok(Json(LogsResponse { bot_id, lines }))
}

#[derive(Debug, Serialize)]
pub struct ProcessesResponse {
    processes: Vec<BotProcesses>,
}

/// GET /workers/processes
///
/// Read-only: nothing is remediated.
pub async fn processes(State(state): State<AppState>) -> Result<Json<ProcessesResponse>> {
    let processes = state.fleet.processes().await?;
    Ok(Json(ProcessesResponse { processes }))
}

/// GET /workers/restarts
pub async fn restarts(State(state): State<AppState>) -> Json<RestartsView> {
    Json(state.fleet.supervisor().restarts_view().await)
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub bot_id: BotId,
    pub pid: u32,
}

/// POST /workers/{id}/restart
pub async fn restart(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RestartResponse>> {
    let bot_id = parse_bot_id(&id)?;
    info!(bot_id = %bot_id, "Operator restart requested");
    let pid = state.fleet.force_restart(bot_id, "operator restart").await?;
    Ok(Json(RestartResponse { bot_id, pid }))
}

/// POST /workers/{id}/stop
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StopReport>> {
    let bot_id = parse_bot_id(&id)?;
    info!(bot_id = %bot_id, "Operator stop requested");
    Ok(Json(state.fleet.supervisor().stop(bot_id).await?))
}

/// POST /workers/restart-all
pub async fn restart_all(State(state): State<AppState>) -> Json<RestartAllReport> {
    Json(state.fleet.supervisor().restart_all("operator restart-all").await)
}

/// POST /workers/cleanup
pub async fn cleanup(State(state): State<AppState>) -> Json<CleanupReport> {
    Json(state.fleet.supervisor().cleanup().await)
}

/// POST /workers/sync
pub async fn sync(State(state): State<AppState>) -> Result<Json<SyncSummary>> {
    Ok(Json(state.fleet.sync_now().await?))
}

/// POST /workers/scan
pub async fn scan(State(state): State<AppState>) -> Result<Json<ScanReport>> {
    Ok(Json(state.fleet.scan_now().await?))
}
