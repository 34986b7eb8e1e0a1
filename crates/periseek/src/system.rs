use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};

use crate::error::{BackendError, Result, SeekError};
use crate::product::ProductId;
use crate::registry::{DeviceCallback, DeviceRegistry};
use crate::seeker::{ProductCallback, MIN_SCAN_INTERVAL};

/// Single-slot callback invoked with a reference to a system device.
pub type SystemDeviceCallback<D> = Box<dyn FnMut(&D) + Send>;
/// Single-slot callback invoked with a system quarantine entry.
pub type SystemBlockCallback<D> = Box<dyn FnMut(&BlockedDevice<D>) + Send>;
/// Single-slot callback consuming system seek errors.
pub type SystemSeekErrorCallback = Box<dyn FnMut(SeekError) + Send>;

/// A quarantined system device.
#[derive(Debug)]
pub struct BlockedDevice<D> {
    pub device: D,
    pub cause: Option<BackendError>,
    /// Whether the quarantine lifts automatically when the device is
    /// physically detached.
    pub unblock_after_detach: bool,
}

/// Discovery collaborator driving a [`SystemSeeker`].
///
/// Unlike [`PeripheralBackend`](crate::PeripheralBackend), the scanned
/// handles are the devices themselves; there is no intermediate
/// connection phase. Attachment is a single fallible step.
pub trait SystemBackend {
    /// The system device handle, enumerated and surfaced as-is.
    type Device: Clone;

    /// Return a fresh, complete snapshot of currently present devices.
    fn scan(&mut self) -> std::result::Result<Vec<Self::Device>, BackendError>;

    /// The vendor/product pair of a device. Must be pure.
    fn product_id(&self, device: &Self::Device) -> ProductId;

    /// A stable hash identifying the physical device across scans.
    fn device_hash(&self, device: &Self::Device) -> u64;

    /// Claim the device for use. An error quarantines it until it is
    /// physically detached.
    fn attach(&mut self, _device: &Self::Device) -> std::result::Result<(), BackendError> {
        Ok(())
    }

    /// Release a detaching device.
    ///
    /// An error leaves the device quarantined permanently; its state
    /// is no longer trustworthy.
    fn detach(&mut self, _device: &Self::Device) -> std::result::Result<(), BackendError> {
        Ok(())
    }

    /// Notification: the device was quarantined.
    fn device_blocked(&mut self, _device: &Self::Device) {}

    /// Notification: the device's quarantine was lifted.
    fn device_unblocked(&mut self, _device: &Self::Device) {}
}

/// Polling discovery engine for system-level devices.
///
/// The lifecycle collapses to attached/detached with an orthogonal
/// quarantine. Blocking here is eager where the peripheral engine is
/// lazy: blocking a device without `unblock_after_detach` detaches it
/// immediately, since a permanently distrusted device should not stay
/// claimed.
pub struct SystemSeeker<B: SystemBackend> {
    backend: B,
    registry: DeviceRegistry<B::Device>,
    targeted: AHashSet<ProductId>,
    attached: Vec<B::Device>,
    blocked: AHashMap<u64, BlockedDevice<B::Device>>,
    scan_interval: Duration,
    last_scan: Option<Instant>,
    on_target: Option<ProductCallback>,
    on_drop: Option<ProductCallback>,
    on_block: Option<SystemBlockCallback<B::Device>>,
    on_unblock: Option<SystemDeviceCallback<B::Device>>,
    on_seek_error: Option<SystemSeekErrorCallback>,
    closed: bool,
}

impl<B: SystemBackend> SystemSeeker<B> {
    /// Create a seeker scanning at the minimum interval.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            registry: DeviceRegistry::new(),
            targeted: AHashSet::new(),
            attached: Vec::new(),
            blocked: AHashMap::new(),
            scan_interval: MIN_SCAN_INTERVAL,
            last_scan: None,
            on_target: None,
            on_drop: None,
            on_block: None,
            on_unblock: None,
            on_seek_error: None,
            closed: false,
        }
    }

    /// Create a seeker with a custom scan interval.
    ///
    /// Intervals below [`MIN_SCAN_INTERVAL`] are rejected.
    pub fn with_scan_interval(backend: B, scan_interval: Duration) -> Result<Self> {
        if scan_interval < MIN_SCAN_INTERVAL {
            return Err(SeekError::ScanIntervalBelowMinimum {
                min: MIN_SCAN_INTERVAL,
                got: scan_interval,
            });
        }
        let mut seeker = Self::new(backend);
        seeker.scan_interval = scan_interval;
        Ok(seeker)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SeekError::Closed);
        }
        Ok(())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Start seeking devices with the given product ID.
    pub fn target_product(&mut self, id: ProductId) -> Result<()> {
        self.ensure_open()?;
        if !self.targeted.insert(id) {
            return Ok(());
        }
        log::debug!("targeting product {id}");
        if let Some(cb) = self.on_target.as_mut() {
            cb(id);
        }
        Ok(())
    }

    /// Stop seeking devices with the given product ID, detaching every
    /// attached device that matches it.
    pub fn drop_product(&mut self, id: ProductId) -> Result<()> {
        self.ensure_open()?;
        if !self.targeted.remove(&id) {
            return Ok(());
        }
        let mut index = 0;
        while index < self.attached.len() {
            if self.backend.product_id(&self.attached[index]) == id {
                let device = self.attached.remove(index);
                self.detach_device(&device);
            } else {
                index += 1;
            }
        }
        log::debug!("dropped product {id}");
        if let Some(cb) = self.on_drop.as_mut() {
            cb(id);
        }
        Ok(())
    }

    pub fn is_targeting(&self, id: ProductId) -> bool {
        self.targeted.contains(&id)
    }

    /// Quarantine a device.
    ///
    /// With `unblock_after_detach` the device is disowned in place and
    /// picked back up after an unplug. Without it, the block is
    /// permanent and the device is detached immediately.
    pub fn block_device(
        &mut self,
        device: B::Device,
        cause: Option<BackendError>,
        unblock_after_detach: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let hash = self.backend.device_hash(&device);
        self.block_internal(device, cause, unblock_after_detach)?;
        if !unblock_after_detach {
            self.detach_if_attached(hash);
        }
        Ok(())
    }

    fn block_internal(
        &mut self,
        device: B::Device,
        cause: Option<BackendError>,
        unblock_after_detach: bool,
    ) -> Result<()> {
        let hash = self.backend.device_hash(&device);
        if self.blocked.contains_key(&hash) {
            return Err(SeekError::AlreadyBlocked);
        }
        let subject = device.clone();
        self.blocked.insert(
            hash,
            BlockedDevice { device, cause, unblock_after_detach },
        );
        log::debug!("blocked device {hash:#x}");
        self.backend.device_blocked(&subject);
        if let Some(cb) = self.on_block.as_mut() {
            if let Some(entry) = self.blocked.get(&hash) {
                cb(entry);
            }
        }
        Ok(())
    }

    /// Lift a device's quarantine.
    ///
    /// Returns `false` without side effects if the device was not
    /// blocked.
    pub fn unblock_device(&mut self, device: &B::Device) -> Result<bool> {
        self.ensure_open()?;
        let hash = self.backend.device_hash(device);
        Ok(self.unblock_by_hash(hash))
    }

    fn unblock_by_hash(&mut self, hash: u64) -> bool {
        let Some(entry) = self.blocked.remove(&hash) else {
            return false;
        };
        log::debug!("unblocked device {hash:#x}");
        self.backend.device_unblocked(&entry.device);
        if let Some(cb) = self.on_unblock.as_mut() {
            cb(&entry.device);
        }
        true
    }

    pub fn is_device_blocked(&self, device: &B::Device) -> bool {
        self.blocked.contains_key(&self.backend.device_hash(device))
    }

    pub fn is_device_attached(&self, device: &B::Device) -> bool {
        let hash = self.backend.device_hash(device);
        self.attached
            .iter()
            .any(|d| self.backend.device_hash(d) == hash)
    }

    /// Devices currently attached, in attachment order.
    pub fn attached_devices(&self) -> &[B::Device] {
        &self.attached
    }

    /// Run one seek cycle.
    ///
    /// Errors are handed to the seek-error callback if one is set (and
    /// swallowed); otherwise they are returned.
    pub fn seek(&mut self) -> Result<()> {
        self.ensure_open()?;
        match self.seek_impl() {
            Ok(()) => Ok(()),
            Err(error) => {
                if let Some(cb) = self.on_seek_error.as_mut() {
                    cb(error);
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }

    fn seek_impl(&mut self) -> Result<()> {
        if self.targeted.is_empty() {
            return Err(SeekError::NoTargets);
        }
        let due = self
            .last_scan
            .map_or(true, |at| at.elapsed() >= self.scan_interval);
        if due {
            self.scan_pass()?;
            self.last_scan = Some(Instant::now());
        }
        Ok(())
    }

    fn scan_pass(&mut self) -> Result<()> {
        let scanned = self.backend.scan().map_err(SeekError::Scan)?;
        let scanned_hashes: AHashSet<u64> = scanned
            .iter()
            .map(|d| self.backend.device_hash(d))
            .collect();

        let mut index = 0;
        while index < self.attached.len() {
            let hash = self.backend.device_hash(&self.attached[index]);
            if scanned_hashes.contains(&hash) {
                index += 1;
            } else {
                let device = self.attached.remove(index);
                self.detach_device(&device);
            }
        }

        for device in scanned {
            if !self.targeted.contains(&self.backend.product_id(&device)) {
                continue;
            }
            let hash = self.backend.device_hash(&device);
            if self.blocked.contains_key(&hash) {
                continue;
            }
            let already_attached = self
                .attached
                .iter()
                .any(|d| self.backend.device_hash(d) == hash);
            if already_attached {
                continue;
            }
            self.attach_device(device);
        }
        Ok(())
    }

    fn attach_device(&mut self, device: B::Device) {
        let hash = self.backend.device_hash(&device);
        match self.backend.attach(&device) {
            Ok(()) => {
                let _ = self.registry.discover(hash, device.clone());
                self.attached.push(device);
                log::debug!("attached device {hash:#x}");
            }
            Err(cause) => {
                // The device stays attached so the scan diff still sees
                // it vanish and lifts the quarantine on detach.
                log::debug!("device attach failed, quarantining: {cause}");
                self.attached.push(device.clone());
                let _ = self.block_internal(device, Some(cause), true);
            }
        }
    }

    fn detach_device(&mut self, device: &B::Device) {
        let hash = self.backend.device_hash(device);
        if self
            .blocked
            .get(&hash)
            .is_some_and(|entry| entry.unblock_after_detach)
        {
            self.unblock_by_hash(hash);
        }
        // The release hook only runs for devices that were claimed;
        // a device whose attach failed was never handed out.
        let claimed = self.registry.forget(hash).ok().flatten().is_some();
        if claimed {
            if let Err(cause) = self.backend.detach(device) {
                log::warn!("device detach failed, quarantining permanently: {cause}");
                let _ = self.block_internal(device.clone(), Some(cause), false);
            }
        }
        log::debug!("detached device {hash:#x}");
    }

    fn detach_if_attached(&mut self, hash: u64) {
        let position = self
            .attached
            .iter()
            .position(|d| self.backend.device_hash(d) == hash);
        if let Some(position) = position {
            let device = self.attached.remove(position);
            self.detach_device(&device);
        }
    }

    /// Make the next `seek()` scan immediately.
    pub fn force_next_scan(&mut self) {
        self.last_scan = None;
    }

    pub fn device(&self, key: u64) -> Option<&B::Device> {
        self.registry.get(key)
    }

    pub fn set_on_discover_device(
        &mut self,
        callback: Option<DeviceCallback<B::Device>>,
    ) -> Result<()> {
        self.registry.set_on_discover(callback)
    }

    pub fn set_on_forget_device(
        &mut self,
        callback: Option<DeviceCallback<B::Device>>,
    ) -> Result<()> {
        self.registry.set_on_forget(callback)
    }

    pub fn set_on_target_product(&mut self, callback: Option<ProductCallback>) -> Result<()> {
        self.ensure_open()?;
        self.on_target = callback;
        Ok(())
    }

    pub fn set_on_drop_product(&mut self, callback: Option<ProductCallback>) -> Result<()> {
        self.ensure_open()?;
        self.on_drop = callback;
        Ok(())
    }

    pub fn set_on_block_device(
        &mut self,
        callback: Option<SystemBlockCallback<B::Device>>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.on_block = callback;
        Ok(())
    }

    pub fn set_on_unblock_device(
        &mut self,
        callback: Option<SystemDeviceCallback<B::Device>>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.on_unblock = callback;
        Ok(())
    }

    pub fn set_on_seek_error(&mut self, callback: Option<SystemSeekErrorCallback>) -> Result<()> {
        self.ensure_open()?;
        self.on_seek_error = callback;
        Ok(())
    }

    /// Close the seeker; idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        while let Some(id) = self.targeted.iter().next().copied() {
            let _ = self.drop_product(id);
        }
        while let Some(hash) = self.blocked.keys().next().copied() {
            self.unblock_by_hash(hash);
        }
        self.on_target = None;
        self.on_drop = None;
        self.on_block = None;
        self.on_unblock = None;
        self.on_seek_error = None;
        self.registry.close();
        self.closed = true;
        log::debug!("seeker closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<B: SystemBackend> Drop for SystemSeeker<B> {
    fn drop(&mut self) {
        self.close();
    }
}
