//! Webhook ingress: authenticate, then forward the raw update to the
//! bot's worker.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use fleet_core::IngestionMode;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::state::{AppState, WebhookAuth, WebhookCounters, parse_bot_id};

#[derive(Debug, Serialize)]
pub struct Accepted {
    ok: bool,
}

fn authorized(auth: &WebhookAuth, headers: &HeaderMap) -> bool {
    let Some(secret) = auth.secret.as_deref() else {
        return false;
    };
    headers
        .get(&auth.header)
        .is_some_and(|presented| bool::from(presented.as_bytes().ct_eq(secret.as_bytes())))
}

/// POST /webhook/{bot_id}
pub async fn receive(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Accepted>> {
    let stats = &state.webhook;
    stats.request();

    if !authorized(&state.auth, &headers) {
        stats.unauthorized();
        warn!(bot_id = %bot_id, "Rejected webhook with missing or wrong secret");
        return Err(AppError::Unauthorized("webhook secret mismatch".to_string()));
    }

    if state.fleet.supervisor().mode().await == IngestionMode::Polling {
        stats.error();
        return Err(AppError::Conflict(
            "fleet is in polling mode, webhooks are not accepted".to_string(),
        ));
    }

    let bot_id = parse_bot_id(&bot_id).inspect_err(|_| stats.error())?;
    if let Err(e) = serde_json::from_str::<serde::de::IgnoredAny>(&body) {
        stats.error();
        return Err(AppError::BadRequest(format!("update is not valid JSON: {e}")));
    }

    match state.fleet.supervisor().forward_webhook(bot_id, body).await {
        Ok(pid) => {
            stats.forwarded();
            debug!(bot_id = %bot_id, pid, "Forwarded webhook update");
            Ok(Json(Accepted { ok: true }))
        }
        Err(e @ fleet_core::Error::WorkerNotFound { .. }) => {
            stats.not_found();
            Err(e.into())
        }
        Err(e) => {
            stats.error();
            Err(e.into())
        }
    }
}

/// GET /webhook/stats
pub async fn stats(State(state): State<AppState>) -> Json<WebhookCounters> {
    Json(state.webhook.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};
    use std::sync::Arc;

    fn auth(secret: Option<&str>) -> WebhookAuth {
        WebhookAuth {
            secret: secret.map(Arc::from),
            header: HeaderName::from_static("x-fleet-webhook-secret"),
        }
    }

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-fleet-webhook-secret", HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_matching_secret_is_authorized() {
        assert!(authorized(&auth(Some("s3cret")), &headers("s3cret")));
    }

    #[test]
    fn test_wrong_or_missing_secret_is_rejected() {
        assert!(!authorized(&auth(Some("s3cret")), &headers("guess")));
        assert!(!authorized(&auth(Some("s3cret")), &HeaderMap::new()));
    }

    #[test]
    fn test_unconfigured_secret_rejects_everything() {
        assert!(!authorized(&auth(None), &headers("anything")));
    }
}
