//! # Orchestrator
//!
//! Supervision of the bot worker fleet: one OS process per active bot,
//! kept alive, deduplicated, health-checked, and restarted under a backoff
//! policy with a fleet-wide circuit breaker.
//!
//! - [`supervisor`]: worker lifecycle, hot reload, webhook forwarding.
//! - [`scanner`]: process-table reconciliation against the registry.
//! - [`health`]: heartbeat and memory checks.
//! - [`policy`]: restart backoff, history, and emergency mode.
//! - [`control_loop`]: the actor that drives every periodic task.
//! - [`fleet`]: the assembled controller.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod alerts;
pub mod config;
pub mod control_loop;
pub mod control_plane;
pub mod fleet;
pub mod health;
pub mod policy;
pub mod process;
pub mod registry;
pub mod scanner;
pub mod scheduler;
pub mod shutdown;
pub mod supervisor;
pub mod views;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use fleet_core::{Error, Result};

pub use alerts::{AlertRecord, AlertSink, EmergencyKind};
pub use config::FleetConfig;
pub use fleet::{BotReloadResult, Fleet, SyncSummary};
pub use health::{HealthMonitor, HeartbeatReport, MemoryReport};
pub use policy::{RestartPolicy, RestartReason};
pub use process::{NativeProcessManager, ProcessManager};
pub use scanner::{Remediation, ScanReport, Scanner, Verdict};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};
pub use supervisor::{HotReloadOutcome, Supervisor};
pub use views::{FleetMetrics, StatusView, WorkerDetail, WorkerView};
