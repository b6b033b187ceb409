//! Domain types shared across the controller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifier of a bot, as assigned by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotId(u64);

impl BotId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BotId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| Error::invalid_bot_id(s))
    }
}

/// Lifecycle status of a worker.
///
/// ```text
/// stopped -> starting -> running -> {crashed | stopping} -> stopped
///                 ^          |
///                 +----------+  (restart)
/// ```
///
/// A worker that dies while still booting moves `starting -> crashed`, and a
/// stop issued during boot moves `starting -> stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl WorkerStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        }
    }

    /// Whether the state machine permits `self -> next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Stopped, Self::Starting)
                | (Self::Starting, Self::Running | Self::Crashed | Self::Stopping)
                | (Self::Running, Self::Crashed | Self::Stopping | Self::Starting)
                | (Self::Crashed | Self::Stopping, Self::Stopped)
        )
    }

    /// A live worker owns (or is about to own) an OS process.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How workers receive platform updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionMode {
    #[default]
    Polling,
    Webhook,
}

impl IngestionMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for IngestionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" => Ok(Self::Polling),
            "webhook" => Ok(Self::Webhook),
            other => Err(Error::invalid_config(format!(
                "unknown ingestion mode '{other}', expected polling or webhook"
            ))),
        }
    }
}

/// Settings a running worker can pick up without a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableSettings {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub display_name: String,
}

/// Identity and credential fields. Changing either forces a restart.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotCredentials {
    pub external_token: String,
    pub external_assistant_id: String,
}

impl fmt::Debug for BotCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotCredentials")
            .field("external_token", &"<redacted>")
            .field("external_assistant_id", &self.external_assistant_id)
            .finish()
    }
}

/// Configuration a worker was started with, plus any hot-reloaded settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub credentials: BotCredentials,
    pub settings: MutableSettings,
    /// Bumped on every applied hot reload.
    pub revision: u64,
}

/// Externally supplied desired configuration for one bot.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredBotConfig {
    pub bot_id: BotId,
    #[serde(default = "default_active")]
    pub active: bool,
    pub external_assistant_id: String,
    pub external_token: String,
    #[serde(default)]
    pub settings: MutableSettings,
}

const fn default_active() -> bool {
    true
}

impl DesiredBotConfig {
    #[must_use]
    pub fn new(bot_id: BotId, external_token: impl Into<String>, assistant_id: impl Into<String>) -> Self {
        Self {
            bot_id,
            active: true,
            external_assistant_id: assistant_id.into(),
            external_token: external_token.into(),
            settings: MutableSettings::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: MutableSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub const fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    #[must_use]
    pub fn credentials(&self) -> BotCredentials {
        BotCredentials {
            external_token: self.external_token.clone(),
            external_assistant_id: self.external_assistant_id.clone(),
        }
    }

    /// Snapshot recorded when a worker is started from this config.
    #[must_use]
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            credentials: self.credentials(),
            settings: self.settings.clone(),
            revision: 0,
        }
    }

    /// Rebuild a desired config from a worker's snapshot.
    #[must_use]
    pub fn from_snapshot(bot_id: BotId, snapshot: &ConfigSnapshot) -> Self {
        Self {
            bot_id,
            active: true,
            external_assistant_id: snapshot.credentials.external_assistant_id.clone(),
            external_token: snapshot.credentials.external_token.clone(),
            settings: snapshot.settings.clone(),
        }
    }
}

impl fmt::Debug for DesiredBotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredBotConfig")
            .field("bot_id", &self.bot_id)
            .field("active", &self.active)
            .field("external_assistant_id", &self.external_assistant_id)
            .field("external_token", &"<redacted>")
            .field("settings", &self.settings)
            .finish()
    }
}
