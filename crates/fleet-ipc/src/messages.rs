//! Message types exchanged between the controller and a worker.
//!
//! **Controller → Worker ([`ControllerMessage`])**: lifecycle commands,
//! hot-reloaded settings, forwarded webhook updates, request responses.
//!
//! **Worker → Controller ([`WorkerMessage`])**: readiness, heartbeats, log
//! lines, hot-reload acknowledgements, requests for controller-side data.
//!
//! Enums are externally tagged so they stay decodable by bincode.

use fleet_core::{IngestionMode, MutableSettings};
use serde::{Deserialize, Serialize};

/// Messages from the controller to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerMessage {
    /// Finish in-flight work and exit.
    Shutdown,

    /// Apply new mutable settings in place.
    HotReload {
        /// Revision the worker must echo in its ack.
        revision: u64,
        settings: MutableSettings,
    },

    /// An inbound platform update received by the webhook router.
    WebhookUpdate {
        /// Raw JSON body as received.
        payload: String,
    },

    /// Drop any cached conversation or assistant state.
    ClearCache,

    /// Switch how the worker receives updates.
    SetMode { mode: IngestionMode },

    /// Answer to a [`WorkerMessage::Request`].
    Response { request_id: u64, body: String },
}

/// Messages from a worker to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// The worker finished booting.
    Ready { pid: u32 },

    /// Periodic liveness signal.
    Heartbeat {
        /// Resident set size as measured by the worker.
        rss_bytes: Option<u64>,
    },

    /// A log line to keep in the worker's ring buffer.
    Log { level: LogLevel, line: String },

    /// Outcome of a [`ControllerMessage::HotReload`].
    HotReloadAck {
        revision: u64,
        applied: bool,
        error: Option<String>,
    },

    /// Ask the controller for data the worker cannot fetch itself.
    Request { request_id: u64, kind: RequestKind },
}

impl WorkerMessage {
    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Log { .. } => "log",
            Self::HotReloadAck { .. } => "hot_reload_ack",
            Self::Request { .. } => "request",
        }
    }

    /// Messages that prove the worker is alive.
    #[must_use]
    pub const fn is_liveness(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Heartbeat { .. })
    }
}

/// Severity of a worker log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// What a worker can ask the controller for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Assistant metadata for the worker's bot, fetched from the control plane.
    AssistantMetadata,
}
