//! hidapi-backed discovery for [`periseek`].
//!
//! Enumeration runs on a background watcher thread so the blocking
//! hidapi calls never stall the seek loop; the backend drains the
//! watcher's events during each scan.

mod backend;
mod watcher;

use thiserror::Error;

pub use backend::{HidBackend, HidHandle, HidPeripheral, HidSeeker, DEFAULT_POLL_INTERVAL};

/// Error type for HID backend construction.
#[derive(Debug, Error)]
pub enum HidError {
    #[error("hidapi init failed: {0}")]
    Init(#[from] hidapi::HidError),
}

/// Convenient result alias for HID backend operations.
pub type Result<T> = std::result::Result<T, HidError>;
