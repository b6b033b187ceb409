//! Request logging and CORS for the control surface.

use axum::{extract::Request, middleware::Next, response::Response};
use http::{Method, StatusCode, Uri};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Operators call the surface from dashboards on other origins.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

/// What we need from a request after it has been handed to the router.
#[derive(Clone, Debug)]
struct RequestContext {
    method: Method,
    uri: Uri,
    start: Instant,
}

impl RequestContext {
    fn from_request(req: &Request) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            start: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn log(&self, status: StatusCode) {
        let duration_ms = self.elapsed().as_millis();
        if status.is_server_error() {
            error!(method = %self.method, uri = %self.uri, status = status.as_u16(), duration_ms, "Server error");
        } else if status.is_client_error() {
            warn!(method = %self.method, uri = %self.uri, status = status.as_u16(), duration_ms, "Client error");
        } else {
            info!(method = %self.method, uri = %self.uri, status = status.as_u16(), duration_ms, "Request completed");
        }
    }
}

/// Log every request with its status and latency.
pub async fn log_requests(req: Request, next: Next) -> Response {
    let ctx = RequestContext::from_request(&req);
    let response = next.run(req).await;
    ctx.log(response.status());
    response
}
