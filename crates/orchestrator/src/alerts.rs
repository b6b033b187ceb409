//! Operator alert sinks for emergency conditions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{Error, Result};
use serde::Serialize;
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

/// Which circuit breaker fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyKind {
    /// Too many workers stopped heartbeating.
    UnresponsiveFleet,
    /// Restart rate over the last hour crossed a threshold.
    RestartStorm,
}

impl EmergencyKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnresponsiveFleet => "unresponsive_fleet",
            Self::RestartStorm => "restart_storm",
        }
    }
}

/// Structured alert emitted when a breaker fires.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub kind: EmergencyKind,
    pub fleet_size: usize,
    /// Observed ratio or count.
    pub observed: f64,
    /// Threshold it was compared against.
    pub threshold: f64,
    pub activated_at: DateTime<Utc>,
    pub reason: String,
}

impl AlertRecord {
    pub fn new(
        kind: EmergencyKind,
        fleet_size: usize,
        observed: f64,
        threshold: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            fleet_size,
            observed,
            threshold,
            activated_at: Utc::now(),
            reason: reason.into(),
        }
    }
}

/// Destination for operator alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver an alert. Delivery failures are reported, never fatal.
    async fn notify(&self, alert: &AlertRecord) -> Result<()>;
}

/// Writes alerts to the log at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn notify(&self, alert: &AlertRecord) -> Result<()> {
        error!(
            alert_id = %alert.id,
            kind = alert.kind.as_str(),
            fleet_size = alert.fleet_size,
            observed = alert.observed,
            threshold = alert.threshold,
            activated_at = %alert.activated_at,
            reason = %alert.reason,
            "EMERGENCY: fleet circuit breaker fired"
        );
        Ok(())
    }
}

/// POSTs alerts as JSON to an operator webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: Url,
}

impl WebhookAlertSink {
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the HTTP client cannot be built.
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::invalid_config(format!("alert webhook client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, alert: &AlertRecord) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(alert)
            .send()
            .await
            .map_err(|e| Error::emergency(format!("alert delivery failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::emergency(format!(
                "alert webhook returned {}",
                response.status()
            )));
        }

        info!(alert_id = %alert.id, url = %self.url, "Alert delivered");
        Ok(())
    }
}

/// Fans an alert out to several sinks, logging individual failures.
pub struct AlertFanout {
    sinks: Vec<std::sync::Arc<dyn AlertSink>>,
}

impl AlertFanout {
    #[must_use]
    pub fn new(sinks: Vec<std::sync::Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    pub async fn notify(&self, alert: &AlertRecord) {
        for sink in &self.sinks {
            if let Err(e) = sink.notify(alert).await {
                tracing::warn!(alert_id = %alert.id, error = %e, "Alert sink failed");
            }
        }
    }
}
