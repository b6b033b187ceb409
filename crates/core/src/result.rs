//! Result type definition and logging combinators.

use crate::error::Error;

/// The standard Result type for fleet operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for results whose failure should be logged and skipped.
///
/// Periodic controller work (scans, health checks, syncs) must never take
/// the controller down, so most call sites log the error and move on.
pub trait ResultExt<T> {
    /// Convert to an Option, logging the error at `warn` with its kind.
    fn into_option_logged(self, context: &str) -> Option<T>;

    /// Get the value or a default, logging the error if present.
    fn or_default_logged(self, context: &str, default: T) -> T;
}

impl<T> ResultExt<T> for Result<T> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "{context} failed");
                None
            }
        }
    }

    fn or_default_logged(self, context: &str, default: T) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "{context} failed, using default");
                default
            }
        }
    }
}
