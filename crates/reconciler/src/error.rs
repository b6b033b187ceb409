//! Error types for the reconciler crate.

use std::fmt;

use fleet_core::BotId;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone)]
pub enum Error {
    /// The desired state could not be fetched. Nothing was applied.
    FetchFailed { reason: String },
    /// The fetched list was rejected as malformed.
    InvalidDesiredState { reason: String },
    /// Action execution failed.
    ActionFailed { action: String, reason: String },
    /// Bot not present in the desired state.
    BotNotFound { bot_id: BotId },
    /// Invalid configuration.
    InvalidConfig { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchFailed { reason } => {
                write!(f, "desired state fetch failed: {reason}")
            }
            Self::InvalidDesiredState { reason } => {
                write!(f, "invalid desired state: {reason}")
            }
            Self::ActionFailed { action, reason } => {
                write!(f, "action '{action}' failed: {reason}")
            }
            Self::BotNotFound { bot_id } => {
                write!(f, "bot {bot_id} not found in desired state")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a fetch failed error.
    pub fn fetch_failed(reason: impl Into<String>) -> Self {
        Self::FetchFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid desired state error.
    pub fn invalid_desired_state(reason: impl Into<String>) -> Self {
        Self::InvalidDesiredState {
            reason: reason.into(),
        }
    }

    /// Create an action failed error.
    pub fn action_failed(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ActionFailed {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Create a bot not found error.
    #[must_use]
    pub const fn bot_not_found(bot_id: BotId) -> Self {
        Self::BotNotFound { bot_id }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl From<Error> for fleet_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::FetchFailed { reason } | Error::InvalidDesiredState { reason } => {
                Self::sync(reason)
            }
            Error::BotNotFound { bot_id } => Self::worker_not_found(bot_id),
            Error::InvalidConfig { reason } => Self::invalid_config(reason),
            other @ Error::ActionFailed { .. } => Self::sync(other.to_string()),
        }
    }
}
