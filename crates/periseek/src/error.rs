use std::time::Duration;

use thiserror::Error;

/// Error reported by a discovery backend.
///
/// Adapters wrap their native library errors (hidapi, rusb) into this
/// type; the engines use it as the quarantine cause for failed setups.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BackendError {
    /// Create a backend error from a message alone.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), source: None }
    }

    /// Create a backend error wrapping a native library error.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { message: message.into(), source: Some(Box::new(source)) }
    }

    /// The human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error type for seeker operations.
#[derive(Debug, Error)]
pub enum SeekError {
    /// The seeker has been closed; no further operations are allowed.
    #[error("seeker is closed")]
    Closed,
    /// `seek()` was called while no products are targeted.
    #[error("no products are targeted")]
    NoTargets,
    /// The peripheral is already blocked.
    #[error("peripheral is already blocked")]
    AlreadyBlocked,
    /// The requested scan interval is below the allowed minimum.
    #[error("scan interval {got:?} is below the minimum {min:?}")]
    ScanIntervalBelowMinimum { min: Duration, got: Duration },
    /// The backend failed to enumerate peripherals.
    #[error("scan failed: {0}")]
    Scan(#[source] BackendError),
}

/// Convenient result alias for seeker operations.
pub type Result<T> = std::result::Result<T, SeekError>;
