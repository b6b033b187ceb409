//! Control surface routes
//!
//! ## Route Structure
//!
//! - `GET /health`, `GET /status`, `GET /metrics`, `GET /mode-status`
//! - `GET /workers`, `GET /workers/{id}`, `GET /workers/{id}/logs`,
//!   `GET /workers/{id}/detailed`, `GET /workers/processes`, `GET /workers/restarts`
//! - `POST /workers/{id}/restart`, `POST /workers/{id}/stop`,
//!   `POST /workers/restart-all`, `POST /workers/cleanup`, `POST /workers/sync`,
//!   `POST /workers/scan`
//! - `POST /reload-bots`, `POST /hot-reload-bots`, `POST /clear-bot-cache`,
//!   `POST /force-restart-bot`, `POST /switch-mode`, `POST /nuclear-cleanup`
//! - `POST /webhook/{bot_id}`, `GET /webhook/stats`
//!
//! Every error is an RFC 7807 problem document.

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

pub mod bots;
pub mod status;
pub mod webhook;
pub mod workers;

/// Assemble every route.
pub fn create_router() -> Router<AppState> {
    let workers = Router::new()
        .route("/workers", get(workers::list_workers))
        .route("/workers/processes", get(workers::processes))
        .route("/workers/restarts", get(workers::restarts))
        .route("/workers/restart-all", post(workers::restart_all))
        .route("/workers/cleanup", post(workers::cleanup))
        .route("/workers/sync", post(workers::sync))
        .route("/workers/scan", post(workers::scan))
        .route("/workers/{id}", get(workers::get_worker))
        .route("/workers/{id}/logs", get(workers::logs))
        .route("/workers/{id}/detailed", get(workers::detailed))
        .route("/workers/{id}/restart", post(workers::restart))
        .route("/workers/{id}/stop", post(workers::stop));

    let bots = Router::new()
        .route("/reload-bots", post(bots::reload_bots))
        .route("/hot-reload-bots", post(bots::hot_reload_bots))
        .route("/clear-bot-cache", post(bots::clear_bot_cache))
        .route("/force-restart-bot", post(bots::force_restart_bot))
        .route("/switch-mode", post(bots::switch_mode))
        .route("/mode-status", get(bots::mode_status))
        .route("/nuclear-cleanup", post(bots::nuclear_cleanup));

    Router::new()
        .route("/health", get(status::health))
        .route("/status", get(status::status))
        .route("/metrics", get(status::metrics))
        .route("/webhook/stats", get(webhook::stats))
        .route("/webhook/{bot_id}", post(webhook::receive))
        .merge(workers)
        .merge(bots)
}
