//! Fleet control surface
//!
//! HTTP API over a running [`Fleet`]: worker inspection and lifecycle
//! commands, fleet-wide operations, and the webhook ingress that forwards
//! platform updates to workers. Served with tower middleware for tracing,
//! compression and CORS.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::future::Future;

use axum::{Router, middleware as axum_middleware};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

pub mod error;
mod middleware;
pub mod routes;
pub mod state;

pub use error::{AppError, ErrorResponse};
pub use state::{AppState, WebhookCounters};

#[doc(no_inline)]
pub use fleet_orchestrator::Fleet;

/// Build the router with its middleware stack.
pub fn create_router(state: AppState) -> Router {
    routes::create_router()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum_middleware::from_fn(middleware::log_requests))
                .layer(CompressionLayer::new())
                .layer(middleware::cors_layer()),
        )
        .with_state(state)
}

/// Serve the control surface until `shutdown` resolves.
///
/// # Errors
///
/// Returns the listener's I/O error.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Control surface listening");
    }
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
