use std::ffi::CString;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;
use hidapi::{DeviceInfo, HidApi, HidDevice};
use periseek::{BackendError, PeripheralBackend, PeripheralSeeker, ProductId};

use crate::watcher::{HidEvent, HidWatcher};
use crate::Result;

/// Fold watcher events into the presence snapshot.
///
/// Deltas are applied before any failure is raised, and every queued
/// error message survives into the single raised error.
fn apply_events(
    present: &mut Vec<HidPeripheral>,
    events: impl Iterator<Item = HidEvent>,
) -> std::result::Result<(), BackendError> {
    let mut failures: Vec<String> = Vec::new();
    for event in events {
        match event {
            HidEvent::Attached(peripheral) => {
                log::debug!("hid attached: {:?}", peripheral.path);
                present.push(peripheral);
            }
            HidEvent::Detached(path) => {
                log::debug!("hid detached: {path:?}");
                present.retain(|p| p.path != path);
            }
            HidEvent::Error(message) => failures.push(message),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(BackendError::new(failures.join("; ")))
    }
}

/// How often the watcher thread re-enumerates the HID bus.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A peripheral seeker backed by [`HidBackend`].
pub type HidSeeker = PeripheralSeeker<HidBackend>;

/// An enumerated HID peripheral, identified by its platform path.
#[derive(Debug, Clone)]
pub struct HidPeripheral {
    pub path: CString,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub product_string: Option<String>,
}

impl HidPeripheral {
    pub(crate) fn from_info(info: &DeviceInfo) -> Self {
        Self {
            path: info.path().to_owned(),
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            serial_number: info.serial_number().map(str::to_owned),
            product_string: info.product_string().map(str::to_owned),
        }
    }
}

/// An opened HID device together with the peripheral it came from.
pub struct HidHandle {
    pub peripheral: HidPeripheral,
    pub device: HidDevice,
}

/// hidapi discovery backend.
///
/// Presence is maintained from the watcher thread's attach/detach
/// events, so a scan pass never blocks on enumeration. Freshly plugged
/// hardware shows up within one watcher poll interval.
pub struct HidBackend {
    api: Arc<Mutex<HidApi>>,
    events: Receiver<HidEvent>,
    _watcher: HidWatcher,
    present: Vec<HidPeripheral>,
    hasher: ahash::RandomState,
}

impl HidBackend {
    /// Create a backend polling at [`DEFAULT_POLL_INTERVAL`].
    pub fn new() -> Result<Self> {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create a backend with a custom watcher poll interval.
    pub fn with_poll_interval(poll_interval: Duration) -> Result<Self> {
        let api = Arc::new(Mutex::new(HidApi::new()?));
        let (tx, rx) = crossbeam_channel::unbounded();
        let watcher = HidWatcher::spawn(api.clone(), tx, poll_interval);
        Ok(Self {
            api,
            events: rx,
            _watcher: watcher,
            present: Vec::new(),
            hasher: ahash::RandomState::new(),
        })
    }

    /// Create a seeker over a fresh backend.
    pub fn seeker() -> Result<HidSeeker> {
        Ok(PeripheralSeeker::new(Self::new()?))
    }
}

impl PeripheralBackend for HidBackend {
    type Peripheral = HidPeripheral;
    type Device = HidHandle;

    fn scan(&mut self) -> std::result::Result<Vec<HidPeripheral>, BackendError> {
        apply_events(&mut self.present, self.events.try_iter())?;
        Ok(self.present.clone())
    }

    fn product_id(&self, peripheral: &HidPeripheral) -> ProductId {
        ProductId::new(peripheral.vendor_id, peripheral.product_id)
    }

    fn peripheral_hash(&self, peripheral: &HidPeripheral) -> u64 {
        self.hasher.hash_one((
            peripheral.path.as_c_str(),
            peripheral.vendor_id,
            peripheral.product_id,
        ))
    }

    fn setup(&mut self, peripheral: &HidPeripheral) -> std::result::Result<HidHandle, BackendError> {
        let api = self
            .api
            .lock()
            .map_err(|_| BackendError::new("hidapi lock poisoned"))?;
        let device = api
            .open_path(&peripheral.path)
            .map_err(|e| BackendError::with_source("failed to open hid device", e))?;
        device
            .set_blocking_mode(false)
            .map_err(|e| BackendError::with_source("failed to set non-blocking mode", e))?;
        Ok(HidHandle { peripheral: peripheral.clone(), device })
    }
}
