//! Control-plane HTTP client.
//!
//! The control plane is the system of record for bot configuration. The
//! controller reads two resources from it:
//!
//! - `GET {base}/bots`: the desired configuration of every bot
//! - `GET {base}/bots/{id}/assistant`: assistant metadata a worker asks for

use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{BotId, DesiredBotConfig, Error, Result};
use fleet_reconciler::{DesiredState, DesiredStateProvider};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::ControlPlaneConfig;

/// Answers a worker's request for its assistant metadata.
#[async_trait]
pub trait AssistantMetadataSource: Send + Sync {
    async fn assistant_metadata(&self, bot_id: BotId) -> Result<Value>;
}

/// The bot list may come bare or wrapped in an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum BotList {
    Bare(Vec<DesiredBotConfig>),
    Wrapped { bots: Vec<DesiredBotConfig> },
}

impl BotList {
    fn into_vec(self) -> Vec<DesiredBotConfig> {
        match self {
            Self::Bare(bots) | Self::Wrapped { bots } => bots,
        }
    }
}

/// reqwest-backed client for the control plane.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpControlPlane {
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the token is not a valid header value or
    /// the HTTP client cannot be built.
    pub fn new(base_url: Url, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::invalid_config(format!("control plane token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::invalid_config(format!("control plane client: {e}")))?;

        Ok(Self {
            client,
            base_url: with_trailing_slash(base_url),
        })
    }

    /// Build a client when a base URL is configured.
    ///
    /// # Errors
    ///
    /// See [`HttpControlPlane::new`].
    pub fn from_config(config: &ControlPlaneConfig) -> Result<Option<Self>> {
        config
            .base_url
            .clone()
            .map(|url| Self::new(url, config.token.as_deref(), config.timeout))
            .transpose()
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::control_plane(format!("invalid path '{path}': {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::control_plane(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::control_plane(format!("GET {url} returned {status}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::control_plane(format!("GET {url}: invalid body: {e}")))
    }

    /// Fetch every bot configuration, active or not.
    ///
    /// # Errors
    ///
    /// Returns `ControlPlane` on transport failure, non-2xx status, or an
    /// undecodable body.
    pub async fn fetch_bots(&self) -> Result<Vec<DesiredBotConfig>> {
        let bots = self.get_json::<BotList>("bots").await?.into_vec();
        debug!(bots = bots.len(), "Fetched bot configurations");
        Ok(bots)
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[async_trait]
impl DesiredStateProvider for HttpControlPlane {
    async fn fetch(&self) -> fleet_reconciler::Result<DesiredState> {
        self.fetch_bots()
            .await
            .map(DesiredState::from_configs)
            .map_err(|e| fleet_reconciler::Error::fetch_failed(e.to_string()))
    }
}

#[async_trait]
impl AssistantMetadataSource for HttpControlPlane {
    async fn assistant_metadata(&self, bot_id: BotId) -> Result<Value> {
        self.get_json(&format!("bots/{bot_id}/assistant")).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client = HttpControlPlane::new(
            Url::parse("http://cp.internal/api/v1").unwrap(),
            Some("secret"),
            Duration::from_secs(1),
        )
        .unwrap();

        assert_eq!(client.base_url().as_str(), "http://cp.internal/api/v1/");
        assert_eq!(
            client.endpoint("bots/42/assistant").unwrap().as_str(),
            "http://cp.internal/api/v1/bots/42/assistant"
        );
    }

    #[test]
    fn test_invalid_token_is_config_error() {
        let err = HttpControlPlane::new(
            Url::parse("http://cp.internal").unwrap(),
            Some("bad\ntoken"),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }

    #[test]
    fn test_bot_list_accepts_both_shapes() {
        let body = r#"[{"bot_id": 1, "external_assistant_id": "a", "external_token": "t"}]"#;
        let bare: BotList = serde_json::from_str(body).unwrap();
        assert_eq!(bare.into_vec().len(), 1);

        let wrapped: BotList = serde_json::from_str(&format!(r#"{{"bots": {body}}}"#)).unwrap();
        let bots = wrapped.into_vec();
        assert_eq!(bots[0].bot_id, BotId::new(1));
        assert!(bots[0].active);
    }

    #[test]
    fn test_from_config_without_url() {
        assert!(
            HttpControlPlane::from_config(&ControlPlaneConfig::default())
                .unwrap()
                .is_none()
        );
    }
}
