//! Controller configuration.
//!
//! Loaded from a TOML file with one table per component, then overridden by
//! `FLEET_*` environment variables. Every table is optional and falls back to
//! its defaults, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_core::{Error, IngestionMode, Result};
use serde::{Deserialize, Serialize};
use url::Url;

const REDACTED: &str = "<redacted>";

/// Widest the emergency throttle may stretch cooldowns and timeouts.
pub const MAX_COOLDOWN_MULTIPLIER: f64 = 100.0;

/// Full controller configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub supervisor: SupervisorConfig,
    pub sync: SyncConfig,
    pub scanner: ScannerConfig,
    pub health: HealthConfig,
    pub restart: RestartConfig,
    pub emergency: EmergencyConfig,
    pub control_plane: ControlPlaneConfig,
    pub server: ServerConfig,
}

/// Worker spawn and stop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Executable started for every worker.
    pub worker_command: String,
    pub worker_args: Vec<String>,
    /// Hard ceiling on live workers.
    pub max_workers: usize,
    #[serde(rename = "start_lock_grace_secs", with = "duration_secs")]
    pub start_lock_grace: Duration,
    #[serde(rename = "graceful_stop_timeout_secs", with = "duration_secs")]
    pub graceful_stop_timeout: Duration,
    #[serde(rename = "terminate_timeout_secs", with = "duration_secs")]
    pub terminate_timeout: Duration,
    #[serde(rename = "kill_timeout_secs", with = "duration_secs")]
    pub kill_timeout: Duration,
    /// Lines kept per worker log ring buffer.
    pub log_buffer_lines: usize,
    #[serde(rename = "hot_reload_ack_timeout_secs", with = "duration_secs")]
    pub hot_reload_ack_timeout: Duration,
    /// Environment variable that tags a process with its bot id.
    pub tag_env: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_command: "fleet-worker".to_string(),
            worker_args: Vec::new(),
            max_workers: 1000,
            start_lock_grace: Duration::from_secs(10),
            graceful_stop_timeout: Duration::from_secs(10),
            terminate_timeout: Duration::from_secs(3),
            kill_timeout: Duration::from_secs(2),
            log_buffer_lines: 200,
            hot_reload_ack_timeout: Duration::from_secs(5),
            tag_env: "FLEET_BOT_ID".to_string(),
        }
    }
}

impl SupervisorConfig {
    /// Create a config for testing with short timeouts.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            worker_command: "fake-worker".to_string(),
            max_workers: 50,
            start_lock_grace: Duration::from_millis(500),
            graceful_stop_timeout: Duration::from_millis(200),
            terminate_timeout: Duration::from_millis(100),
            kill_timeout: Duration::from_millis(100),
            log_buffer_lines: 20,
            hot_reload_ack_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_worker_command(mut self, command: impl Into<String>) -> Self {
        self.worker_command = command.into();
        self
    }

    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    #[must_use]
    pub const fn with_graceful_stop_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_stop_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_start_lock_grace(mut self, grace: Duration) -> Self {
        self.start_lock_grace = grace;
        self
    }

    #[must_use]
    pub const fn with_hot_reload_ack_timeout(mut self, timeout: Duration) -> Self {
        self.hot_reload_ack_timeout = timeout;
        self
    }
}

/// Desired-state synchronization schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    #[serde(rename = "interval_secs", with = "duration_secs")]
    pub interval: Duration,
    #[serde(rename = "jitter_ms", with = "duration_ms")]
    pub jitter: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            jitter: Duration::from_millis(2000),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(100),
            jitter: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Process table scanner schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    #[serde(rename = "interval_secs", with = "duration_secs")]
    pub interval: Duration,
    /// Wait before re-verifying a duplicate remediation.
    #[serde(rename = "duplicate_grace_ms", with = "duration_ms")]
    pub duplicate_grace: Duration,
    /// Root of the process filesystem.
    pub proc_root: PathBuf,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            duplicate_grace: Duration::from_millis(2000),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl ScannerConfig {
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(100),
            duplicate_grace: Duration::from_millis(10),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }
}

/// Heartbeat and memory checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(rename = "check_interval_secs", with = "duration_secs")]
    pub check_interval: Duration,
    #[serde(rename = "heartbeat_timeout_secs", with = "duration_secs")]
    pub heartbeat_timeout: Duration,
    #[serde(rename = "memory_check_interval_secs", with = "duration_secs")]
    pub memory_check_interval: Duration,
    pub memory_limit_mb: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            memory_check_interval: Duration::from_secs(60),
            memory_limit_mb: 512,
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            check_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_secs(3),
            memory_check_interval: Duration::from_millis(100),
            memory_limit_mb: 64,
        }
    }

    #[must_use]
    pub const fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_memory_limit_mb(mut self, limit: u64) -> Self {
        self.memory_limit_mb = limit;
        self
    }
}

/// Restart backoff, cooldown and rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    #[serde(rename = "base_delay_secs", with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_secs", with = "duration_secs")]
    pub max_delay: Duration,
    /// Largest exponent applied to the base delay.
    pub cap_exponent: u32,
    /// Window after a restart during which new requests are suppressed.
    #[serde(rename = "cooldown_secs", with = "duration_secs")]
    pub cooldown: Duration,
    /// Minimum time a request sits in the queue before it runs.
    #[serde(rename = "dwell_ms", with = "duration_ms")]
    pub dwell: Duration,
    pub max_restarts_per_hour: u32,
    /// Continuous healthy running time that resets a bot's history.
    #[serde(rename = "stabilization_secs", with = "duration_secs")]
    pub stabilization: Duration,
    #[serde(rename = "queue_interval_ms", with = "duration_ms")]
    pub queue_interval: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            cap_exponent: 4,
            cooldown: Duration::from_secs(30),
            dwell: Duration::from_millis(2000),
            max_restarts_per_hour: 10,
            stabilization: Duration::from_secs(600),
            queue_interval: Duration::from_millis(1000),
        }
    }
}

impl RestartConfig {
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(800),
            cap_exponent: 4,
            cooldown: Duration::from_millis(100),
            dwell: Duration::from_millis(20),
            max_restarts_per_hour: 10,
            stabilization: Duration::from_secs(5),
            queue_interval: Duration::from_millis(10),
        }
    }

    #[must_use]
    pub const fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    #[must_use]
    pub const fn with_max_restarts_per_hour(mut self, max: u32) -> Self {
        self.max_restarts_per_hour = max;
        self
    }
}

/// Fleet-wide circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    /// Breakers only evaluate when the fleet is larger than this.
    pub min_fleet_size: usize,
    /// Fraction of unresponsive workers that triggers a fleet reload.
    pub unresponsive_ratio: f64,
    /// Restarts in the last hour, as a fraction of fleet size, that trigger throttling.
    pub restart_rate_ratio: f64,
    /// Restarts in the last hour that trigger throttling regardless of fleet size.
    pub restart_rate_absolute: usize,
    /// Factor applied to cooldowns and heartbeat timeouts while throttled.
    pub cooldown_multiplier: f64,
    #[serde(rename = "duration_secs", with = "duration_secs")]
    pub duration: Duration,
    /// Pause between stopping and reloading the fleet.
    #[serde(rename = "reload_pause_secs", with = "duration_secs")]
    pub reload_pause: Duration,
    pub alert_webhook_url: Option<Url>,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            min_fleet_size: 2,
            unresponsive_ratio: 0.95,
            restart_rate_ratio: 0.5,
            restart_rate_absolute: 200,
            cooldown_multiplier: 3.0,
            duration: Duration::from_secs(900),
            reload_pause: Duration::from_secs(30),
            alert_webhook_url: None,
        }
    }
}

impl EmergencyConfig {
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            duration: Duration::from_secs(10),
            reload_pause: Duration::from_millis(50),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_min_fleet_size(mut self, size: usize) -> Self {
        self.min_fleet_size = size;
        self
    }

    #[must_use]
    pub const fn with_restart_rate_absolute(mut self, absolute: usize) -> Self {
        self.restart_rate_absolute = absolute;
        self
    }
}

/// Control-plane API client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub base_url: Option<Url>,
    pub token: Option<String>,
    #[serde(rename = "timeout_secs", with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub webhook_secret: Option<String>,
    pub webhook_secret_header: String,
    /// Ingestion mode the fleet starts in.
    pub mode: IngestionMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            webhook_secret: None,
            webhook_secret_header: "x-fleet-webhook-secret".to_string(),
            mode: IngestionMode::Polling,
        }
    }
}

impl FleetConfig {
    /// Config with millisecond intervals for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            supervisor: SupervisorConfig::for_testing(),
            sync: SyncConfig::for_testing(),
            scanner: ScannerConfig::for_testing(),
            health: HealthConfig::for_testing(),
            restart: RestartConfig::for_testing(),
            emergency: EmergencyConfig::for_testing(),
            control_plane: ControlPlaneConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Load from `path`, apply environment overrides, and validate.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the file cannot be parsed, an override is
    /// malformed, or validation fails.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)?
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        let config = config.with_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on a parse error.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::invalid_config(format!("failed to parse config: {e}")))
    }

    /// Apply `FLEET_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when a URL or mode override cannot be parsed.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("FLEET_CONTROL_PLANE_URL") {
            let parsed = Url::parse(&url).map_err(|e| {
                Error::invalid_config(format!("FLEET_CONTROL_PLANE_URL is not a URL: {e}"))
            })?;
            self.control_plane.base_url = Some(parsed);
        }
        if let Some(token) = lookup("FLEET_CONTROL_PLANE_TOKEN") {
            self.control_plane.token = Some(token);
        }
        if let Some(secret) = lookup("FLEET_WEBHOOK_SECRET") {
            self.server.webhook_secret = Some(secret);
        }
        if let Some(bind) = lookup("FLEET_BIND") {
            self.server.bind = bind;
        }
        if let Some(command) = lookup("FLEET_WORKER_COMMAND") {
            self.supervisor.worker_command = command;
        }
        if let Some(mode) = lookup("FLEET_MODE") {
            self.server.mode = mode.parse()?;
        }
        Ok(self)
    }

    /// Reject configurations the controller cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("sync.interval_secs", self.sync.interval),
            ("scanner.interval_secs", self.scanner.interval),
            ("health.check_interval_secs", self.health.check_interval),
            ("health.heartbeat_timeout_secs", self.health.heartbeat_timeout),
            (
                "health.memory_check_interval_secs",
                self.health.memory_check_interval,
            ),
            ("restart.base_delay_secs", self.restart.base_delay),
            ("restart.queue_interval_ms", self.restart.queue_interval),
        ];
        if let Some((key, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::invalid_config(format!("{key} must be greater than zero")));
        }

        if self.restart.base_delay > self.restart.max_delay {
            return Err(Error::invalid_config(
                "restart.base_delay_secs must not exceed restart.max_delay_secs",
            ));
        }

        let ratios = [
            ("emergency.unresponsive_ratio", self.emergency.unresponsive_ratio),
            ("emergency.restart_rate_ratio", self.emergency.restart_rate_ratio),
        ];
        for (key, ratio) in ratios {
            if !(0.0..=1.0).contains(&ratio) || ratio <= 0.0 {
                return Err(Error::invalid_config(format!(
                    "{key} must be in (0, 1], got {ratio}"
                )));
            }
        }

        let multiplier = self.emergency.cooldown_multiplier;
        if !multiplier.is_finite() || !(1.0..=MAX_COOLDOWN_MULTIPLIER).contains(&multiplier) {
            return Err(Error::invalid_config(format!(
                "emergency.cooldown_multiplier must be between 1 and {MAX_COOLDOWN_MULTIPLIER}, got {multiplier}"
            )));
        }
        if self.supervisor.max_workers == 0 {
            return Err(Error::invalid_config("supervisor.max_workers must be at least 1"));
        }
        if self.supervisor.worker_command.trim().is_empty() {
            return Err(Error::invalid_config("supervisor.worker_command is empty"));
        }

        Ok(())
    }

    /// Copy with secrets masked, for printing.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.control_plane.token.is_some() {
            copy.control_plane.token = Some(REDACTED.to_string());
        }
        if copy.server.webhook_secret.is_some() {
            copy.server.webhook_secret = Some(REDACTED.to_string());
        }
        copy
    }
}

/// Serialization helper for Duration as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serialization helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
