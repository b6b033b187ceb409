//! Core types and errors shared by every fleet crate.
//!
//! - [`types`]: bot identity, worker status state machine, desired configuration.
//! - [`error`]: the controller's error taxonomy.
//! - [`result`]: `Result` alias and logging combinators.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod result;
pub mod types;

pub use error::Error;
pub use result::{Result, ResultExt};
pub use types::{
    BotCredentials, BotId, ConfigSnapshot, DesiredBotConfig, IngestionMode, MutableSettings,
    WorkerStatus,
};
