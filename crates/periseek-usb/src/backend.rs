use std::fmt;
use std::time::Instant;

use ahash::AHashMap;
use periseek::{
    AttachPolicy, BackendError, DeferredAttach, PeripheralBackend, PeripheralSeeker, ProductId,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::retry::RetryQueue;
use crate::Result;

/// A peripheral seeker backed by [`UsbBackend`].
pub type UsbSeeker = PeripheralSeeker<UsbBackend>;

/// An enumerated USB device, identified by bus position.
#[derive(Clone)]
pub struct UsbPeripheral {
    pub device: Device<Context>,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Debug for UsbPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbPeripheral")
            .field("bus", &self.device.bus_number())
            .field("address", &self.device.address())
            .field("vendor_id", &format_args!("{:04x}", self.vendor_id))
            .field("product_id", &format_args!("{:04x}", self.product_id))
            .finish()
    }
}

/// An opened USB device together with the peripheral it came from.
pub struct UsbHandle {
    pub peripheral: UsbPeripheral,
    pub handle: DeviceHandle<Context>,
}

/// rusb discovery backend.
///
/// New devices defer connection through a retry queue, since a libusb
/// open right after plug-in often fails while the OS is still applying
/// permissions. Handles opened by the queue are kept and consumed by
/// the subsequent setup.
pub struct UsbBackend {
    context: Context,
    pending: RetryQueue<UsbPeripheral>,
    opened: AHashMap<u64, DeviceHandle<Context>>,
}

impl UsbBackend {
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: Context::new()?,
            pending: RetryQueue::new(),
            opened: AHashMap::new(),
        })
    }

    /// Create a seeker over a fresh backend.
    pub fn seeker() -> Result<UsbSeeker> {
        Ok(PeripheralSeeker::new(Self::new()?))
    }
}

/// Bus position and descriptor IDs packed into a stable hash. The bus
/// address is reassigned on replug, which is exactly the lifetime a
/// quarantine entry should have.
fn hash_of(peripheral: &UsbPeripheral) -> u64 {
    u64::from(peripheral.device.bus_number()) << 40
        | u64::from(peripheral.device.address()) << 32
        | u64::from(peripheral.vendor_id) << 16
        | u64::from(peripheral.product_id)
}

impl PeripheralBackend for UsbBackend {
    type Peripheral = UsbPeripheral;
    type Device = UsbHandle;

    fn scan(&mut self) -> std::result::Result<Vec<UsbPeripheral>, BackendError> {
        let devices = self
            .context
            .devices()
            .map_err(|e| BackendError::with_source("usb enumeration failed", e))?;
        let mut scanned = Vec::new();
        for device in devices.iter() {
            // Unreadable descriptors are common for devices mid-detach.
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            scanned.push(UsbPeripheral {
                device,
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
            });
        }
        Ok(scanned)
    }

    fn product_id(&self, peripheral: &UsbPeripheral) -> ProductId {
        ProductId::new(peripheral.vendor_id, peripheral.product_id)
    }

    fn peripheral_hash(&self, peripheral: &UsbPeripheral) -> u64 {
        hash_of(peripheral)
    }

    fn attach_policy(&mut self, peripheral: &UsbPeripheral) -> AttachPolicy {
        self.pending.push(peripheral.clone());
        AttachPolicy::Defer
    }

    fn poll_deferred(&mut self) -> Vec<DeferredAttach<UsbPeripheral>> {
        let now = Instant::now();
        let mut outcomes = Vec::new();
        for entry in self.pending.take_ready(now) {
            match entry.peripheral.device.open() {
                Ok(handle) => {
                    self.opened.insert(hash_of(&entry.peripheral), handle);
                    outcomes.push(DeferredAttach::Connect(entry.peripheral));
                }
                Err(error) => {
                    log::debug!("usb open failed ({error}), {} attempts left", entry.attempts_left - 1);
                    if let Some(spent) = self.pending.requeue(entry, now) {
                        outcomes.push(DeferredAttach::Reject {
                            peripheral: spent.peripheral,
                            cause: BackendError::with_source("usb device failed to open", error),
                        });
                    }
                }
            }
        }
        outcomes
    }

    fn setup(&mut self, peripheral: &UsbPeripheral) -> std::result::Result<UsbHandle, BackendError> {
        let hash = hash_of(peripheral);
        let handle = match self.opened.remove(&hash) {
            Some(handle) => handle,
            None => peripheral
                .device
                .open()
                .map_err(|e| BackendError::with_source("usb device failed to open", e))?,
        };
        Ok(UsbHandle { peripheral: peripheral.clone(), handle })
    }

    fn peripheral_detached(&mut self, peripheral: &UsbPeripheral) {
        let hash = hash_of(peripheral);
        self.pending.remove_where(|p| hash_of(p) == hash);
        self.opened.remove(&hash);
    }
}
