//! Desired-state synchronization for the bot worker fleet.
//!
//! This crate implements a reconciliation pattern inspired by Kubernetes:
//!
//! - **Desired State**: the bot configurations the control plane says should run
//! - **Actual State**: what the supervisor's registry currently holds
//! - **Diff**: compare desired vs actual
//! - **Actions**: start, stop, restart, or hot-reload workers to converge
//!
//! # Actions
//!
//! - `StartWorker` - an active bot has no worker
//! - `StopWorker` - a worker's bot was deactivated or removed
//! - `RestartWorker` - a critical field changed, or the worker crashed
//! - `HotReload` - only mutable settings changed
//!
//! The crate owns no timers. The controller's scheduler calls
//! [`Synchronizer::sync_once`] on its interval.
//!
//! # Example
//!
//! ```ignore
//! use fleet_reconciler::{
//!     DesiredState, InMemoryDesiredStateProvider, Reconciler, ReconcilerConfig, Synchronizer,
//! };
//! use std::sync::Arc;
//!
//! let reconciler = Arc::new(Reconciler::new(supervisor.clone(), ReconcilerConfig::default()));
//! let desired = Arc::new(InMemoryDesiredStateProvider::new(DesiredState::new()));
//! let sync = Synchronizer::new(reconciler, desired, supervisor);
//! let result = sync.sync_once().await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod hot_reload;
pub mod reconciler;
pub mod synchronizer;
pub mod types;

pub use error::{Error, Result};
pub use hot_reload::{ConfigDelta, ConfigField, changed_fields, classify};
pub use reconciler::{ActionExecutor, Reconciler, ReconcilerBuilder, ReconcilerConfig};
pub use synchronizer::{
    ActualStateProvider, DesiredStateProvider, InMemoryDesiredStateProvider, SyncStats,
    Synchronizer,
};
pub use types::{ActualState, DesiredState, ObservedWorker, ReconcileAction, ReconcileResult};
