//! Error types for the lifecycle core.
//!
//! None of these cross the public API as panics. Cancellation and subscription failures are
//! recovered locally and surface only as values inside reports; configuration errors are the
//! one place a caller receives an `Err`.

use std::time::Duration;

/// Cap the number of corruption issues kept in recovery history.
pub const MAX_CORRUPTION_HISTORY: usize = 32;

/// A tracked process refused (or panicked while attempting) to cancel.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("cancellation failed: {reason}")]
pub struct CancelError {
    reason: String,
}

impl CancelError {
    /// Build an error from a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    /// Reason supplied by the failing primitive.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// The transport handle would not accept a state-change listener.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubscribeError {
    /// The handle no longer exists or was never fully constructed.
    #[error("transport handle unavailable: {0}")]
    Unavailable(String),
    /// The handle rejected the listener.
    #[error("listener rejected: {0}")]
    Rejected(String),
    /// The subscription call panicked.
    #[error("subscription panicked: {0}")]
    Panicked(String),
}

/// Invalid lifecycle configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Disconnection grace period must be > 0.
    #[error("disconnection_grace must be > 0 (got {0:?})")]
    InvalidDisconnectionGrace(Duration),
    /// ICE grace period must be > 0.
    #[error("ice_grace must be > 0 (got {0:?})")]
    InvalidIceGrace(Duration),
    /// Polling fallback interval must be > 0.
    #[error("polling_interval must be > 0 (got {0:?})")]
    InvalidPollingInterval(Duration),
    /// At least one sweep retry is required during cleanup recovery.
    #[error("max_recovery_attempts must be > 0 (got {0})")]
    InvalidRecoveryAttempts(u32),
    /// No scheduler was supplied and no tokio runtime is running.
    #[error("no scheduler configured and no tokio runtime available")]
    MissingScheduler,
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
