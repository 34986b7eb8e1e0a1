use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};

use crate::error::{BackendError, Result, SeekError};
use crate::peripheral::{AttachPolicy, BlockedPeripheral, DeferredAttach, PeripheralBackend};
use crate::product::ProductId;
use crate::registry::{DeviceCallback, DeviceRegistry};

/// Minimum allowed scan interval.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(1000);

/// Single-slot callback invoked with a product ID.
pub type ProductCallback = Box<dyn FnMut(ProductId) + Send>;
/// Single-slot callback invoked with a reference to a peripheral.
pub type PeripheralCallback<P> = Box<dyn FnMut(&P) + Send>;
/// Single-slot callback invoked with a quarantine entry.
pub type BlockCallback<P> = Box<dyn FnMut(&BlockedPeripheral<P>) + Send>;
/// Single-slot callback that consumes a seek error instead of letting
/// it propagate out of [`PeripheralSeeker::seek`].
pub type SeekErrorCallback = Box<dyn FnMut(SeekError) + Send>;

/// Polling peripheral discovery engine.
///
/// Tracks targeted products and drives each matching peripheral
/// through an attach/connect lifecycle on every [`seek`](Self::seek)
/// call, with a rate-limited scan pass and an orthogonal quarantine
/// mechanism. All state transitions happen synchronously on the
/// calling thread; the expected usage is one `seek()` per application
/// update tick.
pub struct PeripheralSeeker<B: PeripheralBackend> {
    backend: B,
    registry: DeviceRegistry<B::Device>,
    targeted: AHashSet<ProductId>,
    attached: Vec<B::Peripheral>,
    connected: AHashSet<u64>,
    deferred: AHashSet<u64>,
    blocked: AHashMap<u64, BlockedPeripheral<B::Peripheral>>,
    scan_interval: Duration,
    last_scan: Option<Instant>,
    on_target: Option<ProductCallback>,
    on_drop: Option<ProductCallback>,
    on_block: Option<BlockCallback<B::Peripheral>>,
    on_unblock: Option<PeripheralCallback<B::Peripheral>>,
    on_seek_error: Option<SeekErrorCallback>,
    closed: bool,
}

impl<B: PeripheralBackend> PeripheralSeeker<B> {
    /// Create a seeker scanning at the minimum interval.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            registry: DeviceRegistry::new(),
            targeted: AHashSet::new(),
            attached: Vec::new(),
            connected: AHashSet::new(),
            deferred: AHashSet::new(),
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

    /// Start seeking peripherals with the given product ID.
    ///
    /// Targeting an already targeted product is a no-op.
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

    /// Stop seeking peripherals with the given product ID.
    ///
    /// Every attached peripheral matching the ID is disconnected and
    /// then detached, in that order, so shutdown logic still sees the
    /// peripheral as nominally attached. Dropping a product that was
    /// never targeted is a no-op and fires no callback.
    pub fn drop_product(&mut self, id: ProductId) -> Result<()> {
        self.ensure_open()?;
        if !self.targeted.remove(&id) {
            return Ok(());
        }
        let mut index = 0;
        while index < self.attached.len() {
            if self.backend.product_id(&self.attached[index]) == id {
                let peripheral = self.attached.remove(index);
                self.detach_peripheral(peripheral);
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

    /// Product IDs currently being sought.
    pub fn targeted_products(&self) -> impl Iterator<Item = ProductId> + '_ {
        self.targeted.iter().copied()
    }

    /// Quarantine a peripheral.
    ///
    /// The block entry is recorded first, then the peripheral is
    /// force-disconnected if currently connected. Blocking never
    /// detaches; it only suppresses reconnection until the quarantine
    /// is lifted. Blocking an already blocked peripheral fails with
    /// [`SeekError::AlreadyBlocked`].
    pub fn block_peripheral(
        &mut self,
        peripheral: B::Peripheral,
        cause: Option<BackendError>,
        unblock_after_detach: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        self.block_internal(peripheral, cause, unblock_after_detach)
    }

    fn block_internal(
        &mut self,
        peripheral: B::Peripheral,
        cause: Option<BackendError>,
        unblock_after_detach: bool,
    ) -> Result<()> {
        let hash = self.backend.peripheral_hash(&peripheral);
        if self.blocked.contains_key(&hash) {
            return Err(SeekError::AlreadyBlocked);
        }
        let subject = peripheral.clone();
        self.blocked.insert(
            hash,
            BlockedPeripheral { peripheral, cause, unblock_after_detach },
        );
        self.disconnect_peripheral(&subject);
        log::debug!("blocked peripheral {hash:#x}");
        self.backend.peripheral_blocked(&subject);
        if let Some(cb) = self.on_block.as_mut() {
            if let Some(entry) = self.blocked.get(&hash) {
                cb(entry);
            }
        }
        Ok(())
    }

    /// Lift a peripheral's quarantine.
    ///
    /// Returns `false` without side effects if the peripheral was not
    /// blocked. Does not reconnect; the next scan pass picks the
    /// peripheral back up if it is still present and targeted.
    pub fn unblock_peripheral(&mut self, peripheral: &B::Peripheral) -> Result<bool> {
        self.ensure_open()?;
        let hash = self.backend.peripheral_hash(peripheral);
        Ok(self.unblock_by_hash(hash))
    }

    fn unblock_by_hash(&mut self, hash: u64) -> bool {
        let Some(entry) = self.blocked.remove(&hash) else {
            return false;
        };
        log::debug!("unblocked peripheral {hash:#x}");
        self.backend.peripheral_unblocked(&entry.peripheral);
        if let Some(cb) = self.on_unblock.as_mut() {
            cb(&entry.peripheral);
        }
        true
    }

    pub fn is_peripheral_blocked(&self, peripheral: &B::Peripheral) -> bool {
        self.blocked.contains_key(&self.backend.peripheral_hash(peripheral))
    }

    pub fn is_peripheral_attached(&self, peripheral: &B::Peripheral) -> bool {
        let hash = self.backend.peripheral_hash(peripheral);
        self.attached
            .iter()
            .any(|p| self.backend.peripheral_hash(p) == hash)
    }

    pub fn is_peripheral_connected(&self, peripheral: &B::Peripheral) -> bool {
        self.connected
            .contains(&self.backend.peripheral_hash(peripheral))
    }

    /// Peripherals currently known to be present and targeted,
    /// regardless of connection success.
    pub fn attached_peripherals(&self) -> &[B::Peripheral] {
        &self.attached
    }

    /// Run one seek cycle: a rate-limited scan pass followed by a
    /// drain of deferred connection outcomes.
    ///
    /// Errors from the cycle are handed to the seek-error callback if
    /// one is set (and swallowed); otherwise they are returned.
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
        self.drain_deferred();
        Ok(())
    }

    fn scan_pass(&mut self) -> Result<()> {
        let scanned = self.backend.scan().map_err(SeekError::Scan)?;
        let scanned_hashes: AHashSet<u64> = scanned
            .iter()
            .map(|p| self.backend.peripheral_hash(p))
            .collect();

        // Detach whatever vanished since the previous scan.
        let mut index = 0;
        while index < self.attached.len() {
            let hash = self.backend.peripheral_hash(&self.attached[index]);
            if scanned_hashes.contains(&hash) {
                index += 1;
            } else {
                let peripheral = self.attached.remove(index);
                self.detach_peripheral(peripheral);
            }
        }

        // Attach newcomers and (re)attempt connection. Connection is
        // idempotent, so already connected or blocked peripherals are
        // left alone.
        for peripheral in scanned {
            if !self.targeted.contains(&self.backend.product_id(&peripheral)) {
                continue;
            }
            let hash = self.backend.peripheral_hash(&peripheral);
            let already_attached = self
                .attached
                .iter()
                .any(|p| self.backend.peripheral_hash(p) == hash);
            if !already_attached {
                // Quarantined newcomers stay unknown until unblocked,
                // so no attach policy runs for them.
                if self.blocked.contains_key(&hash) {
                    continue;
                }
                self.attached.push(peripheral.clone());
                log::debug!("attached peripheral {hash:#x}");
                if matches!(self.backend.attach_policy(&peripheral), AttachPolicy::Defer) {
                    self.deferred.insert(hash);
                }
            }
            if !self.deferred.contains(&hash) {
                self.connect_peripheral(&peripheral);
            }
        }
        Ok(())
    }

    fn drain_deferred(&mut self) {
        for outcome in self.backend.poll_deferred() {
            match outcome {
                DeferredAttach::Connect(peripheral) => {
                    let hash = self.backend.peripheral_hash(&peripheral);
                    self.deferred.remove(&hash);
                    let attached = self
                        .attached
                        .iter()
                        .any(|p| self.backend.peripheral_hash(p) == hash);
                    if attached {
                        self.connect_peripheral(&peripheral);
                    }
                }
                DeferredAttach::Reject { peripheral, cause } => {
                    let hash = self.backend.peripheral_hash(&peripheral);
                    self.deferred.remove(&hash);
                    let _ = self.block_internal(peripheral, Some(cause), true);
                }
            }
        }
    }

    fn connect_peripheral(&mut self, peripheral: &B::Peripheral) {
        let hash = self.backend.peripheral_hash(peripheral);
        if self.connected.contains(&hash) || self.blocked.contains_key(&hash) {
            return;
        }
        match self.backend.setup(peripheral) {
            Ok(device) => {
                let _ = self.registry.discover(hash, device);
                self.connected.insert(hash);
                log::debug!("connected peripheral {hash:#x}");
            }
            Err(cause) => {
                log::debug!("peripheral setup failed, quarantining: {cause}");
                self.backend.setup_failed(peripheral, &cause);
                let _ = self.block_internal(peripheral.clone(), Some(cause), true);
            }
        }
    }

    fn disconnect_peripheral(&mut self, peripheral: &B::Peripheral) {
        let hash = self.backend.peripheral_hash(peripheral);
        // Connected membership is cleared before the shutdown hook
        // runs, so a shutdown-triggered disconnect is a no-op.
        if !self.connected.remove(&hash) {
            return;
        }
        let device = self.registry.forget(hash).ok().flatten();
        if let Some(device) = device {
            if let Err(cause) = self.backend.shutdown(peripheral, device) {
                log::warn!("peripheral shutdown failed: {cause}");
                self.backend.shutdown_failed(peripheral, &cause);
            }
        }
        log::debug!("disconnected peripheral {hash:#x}");
    }

    fn detach_peripheral(&mut self, peripheral: B::Peripheral) {
        let hash = self.backend.peripheral_hash(&peripheral);
        self.deferred.remove(&hash);
        if self
            .blocked
            .get(&hash)
            .is_some_and(|entry| entry.unblock_after_detach)
        {
            self.unblock_by_hash(hash);
        }
        self.disconnect_peripheral(&peripheral);
        log::debug!("detached peripheral {hash:#x}");
        self.backend.peripheral_detached(&peripheral);
    }

    /// Make the next `seek()` scan immediately instead of waiting out
    /// the remainder of the scan interval.
    pub fn force_next_scan(&mut self) {
        self.last_scan = None;
    }

    /// Manually register a device outside the scan lifecycle.
    pub fn discover_device(&mut self, key: u64, device: B::Device) -> Result<bool> {
        self.registry.discover(key, device)
    }

    /// Manually remove a device registered under the given key.
    pub fn forget_device(&mut self, key: u64) -> Result<Option<B::Device>> {
        self.registry.forget(key)
    }

    pub fn device(&self, key: u64) -> Option<&B::Device> {
        self.registry.get(key)
    }

    /// Devices of currently connected peripherals (plus any manually
    /// discovered ones), in discovery order.
    pub fn devices(&self) -> impl Iterator<Item = &B::Device> {
        self.registry.devices()
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

    pub fn set_on_block_peripheral(
        &mut self,
        callback: Option<BlockCallback<B::Peripheral>>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.on_block = callback;
        Ok(())
    }

    pub fn set_on_unblock_peripheral(
        &mut self,
        callback: Option<PeripheralCallback<B::Peripheral>>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.on_unblock = callback;
        Ok(())
    }

    pub fn set_on_seek_error(&mut self, callback: Option<SeekErrorCallback>) -> Result<()> {
        self.ensure_open()?;
        self.on_seek_error = callback;
        Ok(())
    }

    /// Close the seeker.
    ///
    /// Drains targeted products through [`drop_product`](Self::drop_product)
    /// and quarantine entries through the unblock path, so their side
    /// effects and callbacks fire, then clears all callbacks and
    /// closes the device registry. Idempotent; every mutating method
    /// fails with [`SeekError::Closed`] afterwards.
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

impl<B: PeripheralBackend> Drop for PeripheralSeeker<B> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ahash::AHashSet;

    use super::{PeripheralSeeker, MIN_SCAN_INTERVAL};
    use crate::error::{BackendError, SeekError};
    use crate::peripheral::{AttachPolicy, DeferredAttach, PeripheralBackend};
    use crate::product::ProductId;

    const PAD: ProductId = ProductId::new(0x1, 0x2);
    const WHEEL: ProductId = ProductId::new(0x3, 0x4);

    #[derive(Debug, Clone, PartialEq)]
    struct FakePeripheral {
        id: ProductId,
        serial: u64,
    }

    fn pad(serial: u64) -> FakePeripheral {
        FakePeripheral { id: PAD, serial }
    }

    #[derive(Default)]
    struct FakeBackend {
        present: Vec<FakePeripheral>,
        fail_setup: AHashSet<u64>,
        fail_shutdown: AHashSet<u64>,
        scan_error: Option<String>,
        defer: bool,
        outcomes: Vec<DeferredAttach<FakePeripheral>>,
        detached: Vec<u64>,
        shutdown_failures: Vec<u64>,
        policy_calls: usize,
    }

    impl PeripheralBackend for FakeBackend {
        type Peripheral = FakePeripheral;
        type Device = u64;

        fn scan(&mut self) -> Result<Vec<FakePeripheral>, BackendError> {
            if let Some(message) = self.scan_error.take() {
                return Err(BackendError::new(message));
            }
            Ok(self.present.clone())
        }

        fn product_id(&self, peripheral: &FakePeripheral) -> ProductId {
            peripheral.id
        }

        fn peripheral_hash(&self, peripheral: &FakePeripheral) -> u64 {
            peripheral.serial
        }

        fn attach_policy(&mut self, _peripheral: &FakePeripheral) -> AttachPolicy {
            self.policy_calls += 1;
            if self.defer {
                AttachPolicy::Defer
            } else {
                AttachPolicy::Connect
            }
        }

        fn setup(&mut self, peripheral: &FakePeripheral) -> Result<u64, BackendError> {
            if self.fail_setup.contains(&peripheral.serial) {
                return Err(BackendError::new("setup failed"));
            }
            Ok(peripheral.serial)
        }

        fn shutdown(&mut self, peripheral: &FakePeripheral, _device: u64) -> Result<(), BackendError> {
            if self.fail_shutdown.contains(&peripheral.serial) {
                return Err(BackendError::new("shutdown failed"));
            }
            Ok(())
        }

        fn poll_deferred(&mut self) -> Vec<DeferredAttach<FakePeripheral>> {
            std::mem::take(&mut self.outcomes)
        }

        fn peripheral_detached(&mut self, peripheral: &FakePeripheral) {
            self.detached.push(peripheral.serial);
        }

        fn shutdown_failed(&mut self, peripheral: &FakePeripheral, _cause: &BackendError) {
            self.shutdown_failures.push(peripheral.serial);
        }
    }

    fn seeker() -> PeripheralSeeker<FakeBackend> {
        PeripheralSeeker::new(FakeBackend::default())
    }

    #[test]
    fn seek_without_targets_errors() {
        let mut seeker = seeker();
        assert!(matches!(seeker.seek(), Err(SeekError::NoTargets)));
    }

    #[test]
    fn scan_interval_below_minimum_is_rejected() {
        let result = PeripheralSeeker::with_scan_interval(
            FakeBackend::default(),
            MIN_SCAN_INTERVAL / 2,
        );
        assert!(matches!(
            result,
            Err(SeekError::ScanIntervalBelowMinimum { .. })
        ));
    }

    #[test]
    fn targeted_peripheral_attaches_and_connects_in_one_seek() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().present.push(pad(11));

        seeker.seek().unwrap();
        assert!(seeker.is_peripheral_attached(&pad(11)));
        assert!(seeker.is_peripheral_connected(&pad(11)));
        assert_eq!(seeker.devices().copied().collect::<Vec<_>>(), vec![11]);
    }

    #[test]
    fn untargeted_peripherals_are_ignored() {
        let mut seeker = seeker();
        seeker.target_product(WHEEL).unwrap();
        seeker.backend_mut().present.push(pad(11));

        seeker.seek().unwrap();
        assert!(!seeker.is_peripheral_attached(&pad(11)));
    }

    #[test]
    fn setup_failure_quarantines_until_detach() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().present.push(pad(11));
        seeker.backend_mut().fail_setup.insert(11);

        seeker.seek().unwrap();
        assert!(seeker.is_peripheral_blocked(&pad(11)));
        assert!(seeker.is_peripheral_attached(&pad(11)));
        assert!(!seeker.is_peripheral_connected(&pad(11)));

        // Setup is not retried while blocked, even once it would work.
        seeker.backend_mut().fail_setup.clear();
        seeker.force_next_scan();
        seeker.seek().unwrap();
        assert!(!seeker.is_peripheral_connected(&pad(11)));

        // Unplugging lifts the quarantine.
        seeker.backend_mut().present.clear();
        seeker.force_next_scan();
        seeker.seek().unwrap();
        assert!(!seeker.is_peripheral_blocked(&pad(11)));
        assert!(!seeker.is_peripheral_attached(&pad(11)));
        assert_eq!(seeker.backend().detached, vec![11]);

        // Plugging back in reconnects normally.
        seeker.backend_mut().present.push(pad(11));
        seeker.force_next_scan();
        seeker.seek().unwrap();
        assert!(seeker.is_peripheral_connected(&pad(11)));
    }

    #[test]
    fn blocking_forces_disconnect_but_not_detach() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().present.push(pad(11));
        seeker.seek().unwrap();
        assert!(seeker.is_peripheral_connected(&pad(11)));

        seeker.block_peripheral(pad(11), None, false).unwrap();
        assert!(seeker.is_peripheral_blocked(&pad(11)));
        assert!(!seeker.is_peripheral_connected(&pad(11)));
        assert!(seeker.is_peripheral_attached(&pad(11)));
        assert_eq!(seeker.devices().count(), 0);
    }

    #[test]
    fn double_block_errors() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.block_peripheral(pad(11), None, false).unwrap();
        assert!(matches!(
            seeker.block_peripheral(pad(11), None, true),
            Err(SeekError::AlreadyBlocked)
        ));
    }

    #[test]
    fn unblocking_lets_the_next_scan_reconnect() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().present.push(pad(11));
        seeker.block_peripheral(pad(11), None, false).unwrap();

        seeker.seek().unwrap();
        assert!(!seeker.is_peripheral_connected(&pad(11)));

        assert!(seeker.unblock_peripheral(&pad(11)).unwrap());
        assert!(!seeker.unblock_peripheral(&pad(11)).unwrap());
        seeker.force_next_scan();
        seeker.seek().unwrap();
        assert!(seeker.is_peripheral_connected(&pad(11)));
    }

    #[test]
    fn blocked_newcomer_stays_unknown_until_unblocked() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.block_peripheral(pad(11), None, false).unwrap();
        seeker.backend_mut().present.push(pad(11));

        seeker.seek().unwrap();
        assert!(!seeker.is_peripheral_attached(&pad(11)));
        assert_eq!(seeker.backend().policy_calls, 0);

        assert!(seeker.unblock_peripheral(&pad(11)).unwrap());
        seeker.force_next_scan();
        seeker.seek().unwrap();
        assert!(seeker.is_peripheral_attached(&pad(11)));
        assert!(seeker.is_peripheral_connected(&pad(11)));
        assert_eq!(seeker.backend().policy_calls, 1);
    }

    #[test]
    fn connected_is_subset_of_attached() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().present.push(pad(11));
        seeker.backend_mut().present.push(pad(12));
        seeker.backend_mut().fail_setup.insert(12);
        seeker.seek().unwrap();

        for peripheral in [pad(11), pad(12)] {
            if seeker.is_peripheral_connected(&peripheral) {
                assert!(seeker.is_peripheral_attached(&peripheral));
            }
        }
        assert!(seeker.is_peripheral_attached(&pad(12)));
        assert!(!seeker.is_peripheral_connected(&pad(12)));
    }

    #[test]
    fn target_then_drop_without_scan_has_no_side_effects() {
        let mut seeker = seeker();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_t = events.clone();
        let events_d = events.clone();
        seeker
            .set_on_target_product(Some(Box::new(move |id| {
                events_t.lock().unwrap().push(format!("target {id}"));
            })))
            .unwrap();
        seeker
            .set_on_drop_product(Some(Box::new(move |id| {
                events_d.lock().unwrap().push(format!("drop {id}"));
            })))
            .unwrap();

        seeker.target_product(PAD).unwrap();
        seeker.drop_product(PAD).unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["target 0001:0002".to_owned(), "drop 0001:0002".to_owned()]
        );
        assert_eq!(seeker.attached_peripherals().len(), 0);
        assert_eq!(seeker.devices().count(), 0);
    }

    #[test]
    fn dropping_untargeted_product_is_silent() {
        let mut seeker = seeker();
        let fired = Arc::new(Mutex::new(false));
        let fired_c = fired.clone();
        seeker
            .set_on_drop_product(Some(Box::new(move |_| {
                *fired_c.lock().unwrap() = true;
            })))
            .unwrap();

        seeker.drop_product(PAD).unwrap();
        assert!(!*fired.lock().unwrap());
    }

    #[test]
    fn dropping_a_product_disconnects_then_detaches() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().present.push(pad(11));
        seeker.seek().unwrap();

        seeker.drop_product(PAD).unwrap();
        assert!(!seeker.is_peripheral_attached(&pad(11)));
        assert!(!seeker.is_peripheral_connected(&pad(11)));
        assert_eq!(seeker.devices().count(), 0);
        assert_eq!(seeker.backend().detached, vec![11]);
    }

    #[test]
    fn deferred_peripheral_connects_when_its_outcome_resolves() {
        let mut seeker = seeker();
        seeker.backend_mut().defer = true;
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().present.push(pad(11));

        seeker.seek().unwrap();
        assert!(seeker.is_peripheral_attached(&pad(11)));
        assert!(!seeker.is_peripheral_connected(&pad(11)));

        // Outcomes drain on every seek, even between rate-limited scans.
        seeker
            .backend_mut()
            .outcomes
            .push(DeferredAttach::Connect(pad(11)));
        seeker.seek().unwrap();
        assert!(seeker.is_peripheral_connected(&pad(11)));
    }

    #[test]
    fn deferred_rejection_quarantines_until_detach() {
        let mut seeker = seeker();
        seeker.backend_mut().defer = true;
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().present.push(pad(11));
        seeker.seek().unwrap();

        seeker.backend_mut().outcomes.push(DeferredAttach::Reject {
            peripheral: pad(11),
            cause: BackendError::new("open failed"),
        });
        seeker.seek().unwrap();
        assert!(seeker.is_peripheral_blocked(&pad(11)));
        assert!(!seeker.is_peripheral_connected(&pad(11)));

        seeker.backend_mut().present.clear();
        seeker.force_next_scan();
        seeker.seek().unwrap();
        assert!(!seeker.is_peripheral_blocked(&pad(11)));
    }

    #[test]
    fn shutdown_failure_is_reported_but_never_propagates() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().present.push(pad(11));
        seeker.backend_mut().fail_shutdown.insert(11);
        seeker.seek().unwrap();

        seeker.backend_mut().present.clear();
        seeker.force_next_scan();
        seeker.seek().unwrap();
        assert_eq!(seeker.backend().shutdown_failures, vec![11]);
        assert!(!seeker.is_peripheral_attached(&pad(11)));
    }

    #[test]
    fn scan_errors_propagate_without_a_callback() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().scan_error = Some("bus gone".to_owned());
        assert!(matches!(seeker.seek(), Err(SeekError::Scan(_))));
    }

    #[test]
    fn seek_error_callback_swallows_scan_errors() {
        let mut seeker = seeker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_c = seen.clone();
        seeker
            .set_on_seek_error(Some(Box::new(move |error| {
                seen_c.lock().unwrap().push(error.to_string());
            })))
            .unwrap();
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().scan_error = Some("bus gone".to_owned());

        seeker.seek().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["scan failed: bus gone".to_owned()]);
    }

    #[test]
    fn close_drains_state_and_rejects_further_use() {
        let mut seeker = seeker();
        seeker.target_product(PAD).unwrap();
        seeker.backend_mut().present.push(pad(11));
        seeker.seek().unwrap();
        seeker.block_peripheral(pad(12), None, false).unwrap();

        seeker.close();
        assert!(seeker.is_closed());
        assert!(!seeker.is_peripheral_attached(&pad(11)));
        assert!(!seeker.is_peripheral_blocked(&pad(12)));
        assert!(matches!(seeker.target_product(PAD), Err(SeekError::Closed)));
        assert!(matches!(seeker.seek(), Err(SeekError::Closed)));
        assert!(matches!(
            seeker.block_peripheral(pad(13), None, false),
            Err(SeekError::Closed)
        ));

        // Idempotent.
        seeker.close();
    }
}
