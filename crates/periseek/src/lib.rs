//! Polling discovery engines for I/O peripherals.
//!
//! A [`PeripheralSeeker`] tracks a set of targeted vendor/product IDs
//! and drives each matching peripheral through an attach/connect
//! lifecycle, one `seek()` call per application tick. A
//! [`SystemSeeker`] does the same for device handles that need no
//! connection phase. Both quarantine misbehaving hardware instead of
//! aborting the scan loop.

mod error;
mod peripheral;
mod product;
mod registry;
mod seeker;
mod system;

pub use error::{BackendError, Result, SeekError};
pub use peripheral::{AttachPolicy, BlockedPeripheral, DeferredAttach, PeripheralBackend};
pub use product::ProductId;
pub use registry::{DeviceCallback, DeviceRegistry};
pub use seeker::{
    BlockCallback, PeripheralCallback, PeripheralSeeker, ProductCallback, SeekErrorCallback,
    MIN_SCAN_INTERVAL,
};
pub use system::{
    BlockedDevice, SystemBackend, SystemBlockCallback, SystemDeviceCallback, SystemSeekErrorCallback,
    SystemSeeker,
};
