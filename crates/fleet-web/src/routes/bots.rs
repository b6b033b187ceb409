//! Fleet-wide bot operations: reloads, cache clearing, forced restarts,
//! ingestion mode switching and the nuclear cleanup.

use axum::{extract::State, response::Json};
use fleet_core::{BotId, IngestionMode};
use fleet_orchestrator::supervisor::{CacheClearReport, ModeSwitchReport, NuclearReport};
use fleet_orchestrator::views::FleetCounts;
use fleet_orchestrator::{BotReloadResult, SyncSummary};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::state::AppState;

const DEFAULT_FORCE_RESTART_REASON: &str = "forced restart";

#[derive(Debug, Deserialize)]
pub struct ReloadBotsRequest {
    pub bot_ids: Vec<BotId>,
}

fn require_bots(bot_ids: &[BotId]) -> Result<()> {
    if bot_ids.is_empty() {
        return Err(AppError::BadRequest("bot_ids must not be empty".to_string()));
    }
    Ok(())
}

/// POST /reload-bots
///
/// Re-reads the desired state for the named bots and converges them.
pub async fn reload_bots(
    State(state): State<AppState>,
    Json(request): Json<ReloadBotsRequest>,
) -> Result<Json<SyncSummary>> {
    require_bots(&request.bot_ids)?;
    info!(bots = request.bot_ids.len(), "Reloading bots");
    Ok(Json(state.fleet.reload_bots(&request.bot_ids).await?))
}

#[derive(Debug, Deserialize)]
pub struct HotReloadRequest {
    pub bot_ids: Vec<BotId>,
    #[serde(default)]
    pub force_reload: bool,
}

#[derive(Debug, Serialize)]
pub struct HotReloadResponse {
    results: Vec<BotReloadResult>,
}

/// POST /hot-reload-bots
pub async fn hot_reload_bots(
    State(state): State<AppState>,
    Json(request): Json<HotReloadRequest>,
) -> Result<Json<HotReloadResponse>> {
    require_bots(&request.bot_ids)?;
    let results = state
        .fleet
        .hot_reload_bots(&request.bot_ids, request.force_reload)
        .await?;
    Ok(Json(HotReloadResponse { results }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearCacheRequest {
    /// Empty clears every running worker.
    #[serde(default)]
    pub bot_ids: Vec<BotId>,
}

/// POST /clear-bot-cache
pub async fn clear_bot_cache(
    State(state): State<AppState>,
    Json(request): Json<ClearCacheRequest>,
) -> Json<CacheClearReport> {
    Json(state.fleet.supervisor().clear_cache(&request.bot_ids).await)
}

#[derive(Debug, Deserialize)]
pub struct ForceRestartRequest {
    pub bot_id: BotId,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ForceRestartResponse {
    bot_id: BotId,
    pid: u32,
    reason: String,
}

/// POST /force-restart-bot
///
/// Bypasses backoff and cooldown.
pub async fn force_restart_bot(
    State(state): State<AppState>,
    Json(request): Json<ForceRestartRequest>,
) -> Result<Json<ForceRestartResponse>> {
    let reason = request
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FORCE_RESTART_REASON.to_string());
    warn!(bot_id = %request.bot_id, reason = %reason, "Forcing restart");
    let pid = state.fleet.force_restart(request.bot_id, &reason).await?;
    Ok(Json(ForceRestartResponse {
        bot_id: request.bot_id,
        pid,
        reason,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SwitchModeRequest {
    pub mode: String,
}

/// POST /switch-mode
pub async fn switch_mode(
    State(state): State<AppState>,
    Json(request): Json<SwitchModeRequest>,
) -> Result<Json<ModeSwitchReport>> {
    let mode = request
        .mode
        .parse::<IngestionMode>()
        .map_err(|_| AppError::BadRequest(format!("unknown mode '{}'", request.mode)))?;
    Ok(Json(state.fleet.supervisor().switch_mode(mode).await))
}

#[derive(Debug, Serialize)]
pub struct ModeStatus {
    mode: IngestionMode,
    workers: FleetCounts,
    webhook_accepting: bool,
}

/// GET /mode-status
pub async fn mode_status(State(state): State<AppState>) -> Json<ModeStatus> {
    let supervisor = state.fleet.supervisor();
    let mode = supervisor.mode().await;
    Json(ModeStatus {
        mode,
        workers: supervisor.counts().await,
        webhook_accepting: mode == IngestionMode::Webhook,
    })
}

/// POST /nuclear-cleanup
///
/// Kills every tagged worker process and clears all bookkeeping.
pub async fn nuclear_cleanup(State(state): State<AppState>) -> Json<NuclearReport> {
    warn!("Nuclear cleanup requested");
    Json(state.fleet.supervisor().nuclear_cleanup().await)
}
