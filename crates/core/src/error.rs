//! Controller error taxonomy.
//!
//! No variant here is fatal to the controller process. Startup errors are
//! logged and the operation skipped; exit, health and resource errors are
//! routed to the restart policy; sync errors keep the previous desired state.

use thiserror::Error;

use crate::types::{BotId, WorkerStatus};

/// Core error type for fleet operations.
#[derive(Debug, Error)]
pub enum Error {
    // Startup errors
    #[error("worker for bot {bot_id} is already {status}")]
    DuplicateStart { bot_id: BotId, status: WorkerStatus },

    #[error("fleet limit reached ({current}/{max})")]
    FleetLimitReached { current: usize, max: usize },

    // Worker failures
    #[error("worker for bot {bot_id} exited unexpectedly (code {code:?}, signal {signal:?})")]
    ProcessExit {
        bot_id: BotId,
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("worker for bot {bot_id} missed heartbeats for {silent_secs}s")]
    HealthTimeout { bot_id: BotId, silent_secs: u64 },

    #[error("worker for bot {bot_id} uses {rss_mb}MB, limit is {limit_mb}MB")]
    ResourceLimit {
        bot_id: BotId,
        rss_mb: u64,
        limit_mb: u64,
    },

    // Fleet-wide conditions
    #[error("desired state sync failed: {reason}")]
    Sync { reason: String },

    #[error("emergency condition: {reason}")]
    Emergency { reason: String },

    // Supervisor bookkeeping
    #[error("no worker registered for bot {bot_id}")]
    WorkerNotFound { bot_id: BotId },

    #[error("bot {bot_id} cannot move from {from} to {to}")]
    InvalidTransition {
        bot_id: BotId,
        from: WorkerStatus,
        to: WorkerStatus,
    },

    // OS and IPC boundaries
    #[error("failed to spawn worker for bot {bot_id}: {reason}")]
    Spawn { bot_id: BotId, reason: String },

    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("process table scan failed: {reason}")]
    ProcessScan { reason: String },

    #[error("IPC with worker for bot {bot_id} failed: {reason}")]
    Ipc { bot_id: BotId, reason: String },

    #[error("control plane request failed: {reason}")]
    ControlPlane { reason: String },

    // Input errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("invalid bot id '{value}'")]
    InvalidBotId { value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a duplicate start error.
    pub const fn duplicate_start(bot_id: BotId, status: WorkerStatus) -> Self {
        Self::DuplicateStart { bot_id, status }
    }

    /// Create a fleet limit error.
    pub const fn fleet_limit_reached(current: usize, max: usize) -> Self {
        Self::FleetLimitReached { current, max }
    }

    /// Create a process exit error.
    pub const fn process_exit(bot_id: BotId, code: Option<i32>, signal: Option<i32>) -> Self {
        Self::ProcessExit {
            bot_id,
            code,
            signal,
        }
    }

    /// Create a health timeout error.
    pub const fn health_timeout(bot_id: BotId, silent_secs: u64) -> Self {
        Self::HealthTimeout {
            bot_id,
            silent_secs,
        }
    }

    /// Create a resource limit error.
    pub const fn resource_limit(bot_id: BotId, rss_mb: u64, limit_mb: u64) -> Self {
        Self::ResourceLimit {
            bot_id,
            rss_mb,
            limit_mb,
        }
    }

    /// Create a sync error.
    pub fn sync(reason: impl Into<String>) -> Self {
        Self::Sync {
            reason: reason.into(),
        }
    }

    /// Create an emergency error.
    pub fn emergency(reason: impl Into<String>) -> Self {
        Self::Emergency {
            reason: reason.into(),
        }
    }

    /// Create a worker not found error.
    pub const fn worker_not_found(bot_id: BotId) -> Self {
        Self::WorkerNotFound { bot_id }
    }

    /// Create an invalid transition error.
    pub const fn invalid_transition(bot_id: BotId, from: WorkerStatus, to: WorkerStatus) -> Self {
        Self::InvalidTransition { bot_id, from, to }
    }

    /// Create a spawn error.
    pub fn spawn(bot_id: BotId, reason: impl Into<String>) -> Self {
        Self::Spawn {
            bot_id,
            reason: reason.into(),
        }
    }

    /// Create a signal error.
    pub fn signal(pid: u32, reason: impl Into<String>) -> Self {
        Self::Signal {
            pid,
            reason: reason.into(),
        }
    }

    /// Create a process scan error.
    pub fn process_scan(reason: impl Into<String>) -> Self {
        Self::ProcessScan {
            reason: reason.into(),
        }
    }

    /// Create an IPC error.
    pub fn ipc(bot_id: BotId, reason: impl Into<String>) -> Self {
        Self::Ipc {
            bot_id,
            reason: reason.into(),
        }
    }

    /// Create a control plane error.
    pub fn control_plane(reason: impl Into<String>) -> Self {
        Self::ControlPlane {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid bot id error.
    pub fn invalid_bot_id(value: impl Into<String>) -> Self {
        Self::InvalidBotId {
            value: value.into(),
        }
    }

    /// Stable snake_case classification for logs and HTTP bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateStart { .. } => "duplicate_start",
            Self::FleetLimitReached { .. } => "fleet_limit_reached",
            Self::ProcessExit { .. } => "process_exit",
            Self::HealthTimeout { .. } => "health_timeout",
            Self::ResourceLimit { .. } => "resource_limit",
            Self::Sync { .. } => "sync",
            Self::Emergency { .. } => "emergency",
            Self::WorkerNotFound { .. } => "worker_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Spawn { .. } => "spawn",
            Self::Signal { .. } => "signal",
            Self::ProcessScan { .. } => "process_scan",
            Self::Ipc { .. } => "ipc",
            Self::ControlPlane { .. } => "control_plane",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::InvalidBotId { .. } => "invalid_bot_id",
            Self::Io(_) => "io",
        }
    }

    /// Startup errors are skipped rather than retried.
    #[must_use]
    pub const fn is_startup_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateStart { .. } | Self::FleetLimitReached { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::fleet_limit_reached(1000, 1000);
        assert_eq!(err.to_string(), "fleet limit reached (1000/1000)");
    }

    #[test]
    fn test_process_exit_mentions_bot_and_code() {
        let err = Error::process_exit(BotId::new(42), Some(1), None);
        let text = err.to_string();
        assert!(text.contains("42"));
        assert!(text.contains("Some(1)"));
        assert_eq!(err.kind(), "process_exit");
    }

    #[test]
    fn test_startup_errors_are_classified() {
        assert!(Error::duplicate_start(BotId::new(1), WorkerStatus::Starting).is_startup_error());
        assert!(Error::fleet_limit_reached(1, 1).is_startup_error());
        assert!(!Error::sync("down").is_startup_error());
    }

    #[test]
    fn test_io_error_converts() {
        let err: Error = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), "io");
    }
}
