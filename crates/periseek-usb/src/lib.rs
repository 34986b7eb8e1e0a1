//! rusb-backed discovery for [`periseek`].
//!
//! Opening a libusb device can fail transiently right after plug-in,
//! while the OS is still settling permissions. Connection is therefore
//! deferred through a retry queue that spaces open attempts out across
//! seek cycles before giving up and quarantining.

mod backend;
mod retry;

use thiserror::Error;

pub use backend::{UsbBackend, UsbHandle, UsbPeripheral, UsbSeeker};
pub use retry::{OPEN_ATTEMPTS, RETRY_DELAY};

/// Error type for USB backend construction.
#[derive(Debug, Error)]
pub enum UsbError {
    #[error("libusb init failed: {0}")]
    Rusb(#[from] rusb::Error),
}

/// Convenient result alias for USB backend operations.
pub type Result<T> = std::result::Result<T, UsbError>;
