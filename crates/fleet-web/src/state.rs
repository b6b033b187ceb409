//! Shared handler state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::HeaderName;
use fleet_core::BotId;
use fleet_orchestrator::{Fleet, FleetConfig};
use serde::Serialize;

use crate::error::{AppError, Result};

/// Counters for the webhook ingress.
#[derive(Debug, Default)]
pub struct WebhookStats {
    requests: AtomicU64,
    forwarded: AtomicU64,
    errors: AtomicU64,
    unauthorized: AtomicU64,
    not_found: AtomicU64,
}

/// Point-in-time copy of [`WebhookStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WebhookCounters {
    pub requests: u64,
    pub forwarded: u64,
    pub errors: u64,
    pub unauthorized: u64,
    pub not_found: u64,
}

impl WebhookStats {
    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unauthorized(&self) {
        self.unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> WebhookCounters {
        WebhookCounters {
            requests: self.requests.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
        }
    }
}

/// Webhook authentication settings.
#[derive(Debug, Clone)]
pub struct WebhookAuth {
    /// `None` rejects every webhook.
    pub secret: Option<Arc<str>>,
    pub header: HeaderName,
}

impl WebhookAuth {
    /// # Errors
    ///
    /// `InvalidConfig` when the header name is not a valid HTTP header.
    pub fn from_config(config: &FleetConfig) -> fleet_core::Result<Self> {
        let header = HeaderName::try_from(config.server.webhook_secret_header.as_str()).map_err(|e| {
            fleet_core::Error::invalid_config(format!(
                "webhook_secret_header '{}': {e}",
                config.server.webhook_secret_header
            ))
        })?;
        Ok(Self {
            secret: config.server.webhook_secret.as_deref().map(Arc::from),
            header,
        })
    }
}

/// State handed to every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<Fleet>,
    pub webhook: Arc<WebhookStats>,
    pub auth: WebhookAuth,
}

impl AppState {
    /// # Errors
    ///
    /// `InvalidConfig` when the webhook header name is invalid.
    pub fn new(fleet: Arc<Fleet>) -> fleet_core::Result<Self> {
        let auth = WebhookAuth::from_config(fleet.config())?;
        Ok(Self {
            fleet,
            webhook: Arc::new(WebhookStats::default()),
            auth,
        })
    }
}

/// Parse a bot id taken from a path or body.
pub fn parse_bot_id(raw: &str) -> Result<BotId> {
    raw.parse::<BotId>().map_err(AppError::from)
}
