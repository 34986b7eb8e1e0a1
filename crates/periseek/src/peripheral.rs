use crate::error::BackendError;
use crate::product::ProductId;

/// What the engine should do when a peripheral is first attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPolicy {
    /// Attempt connection immediately, on the attaching scan pass.
    Connect,
    /// Leave connection to the backend's deferred queue; the engine
    /// will act on [`PeripheralBackend::poll_deferred`] outcomes.
    Defer,
}

/// Outcome of a deferred connection attempt.
#[derive(Debug)]
pub enum DeferredAttach<P> {
    /// The peripheral is ready; connect it now.
    Connect(P),
    /// The peripheral could not be readied; quarantine it.
    Reject { peripheral: P, cause: BackendError },
}

/// A quarantined peripheral.
///
/// The entry is keyed by the backend-supplied peripheral hash, so a
/// re-enumerated handle for the same physical device still matches.
#[derive(Debug)]
pub struct BlockedPeripheral<P> {
    pub peripheral: P,
    pub cause: Option<BackendError>,
    /// Whether the quarantine lifts automatically when the peripheral
    /// is physically detached.
    pub unblock_after_detach: bool,
}

/// Discovery collaborator driving a [`PeripheralSeeker`].
///
/// The seeker never constructs peripherals; it classifies and tracks
/// the opaque handles this trait enumerates, and disposes of them
/// through [`shutdown`](Self::shutdown).
///
/// [`PeripheralSeeker`]: crate::PeripheralSeeker
pub trait PeripheralBackend {
    /// Opaque peripheral handle supplied by the discovery library.
    type Peripheral: Clone;
    /// The I/O device surfaced to applications once a peripheral is
    /// connected.
    type Device;

    /// Return a fresh, complete snapshot of currently present
    /// peripherals. Duplicates are tolerated.
    fn scan(&mut self) -> Result<Vec<Self::Peripheral>, BackendError>;

    /// The vendor/product pair of a peripheral. Must be pure.
    fn product_id(&self, peripheral: &Self::Peripheral) -> ProductId;

    /// A stable hash identifying the physical peripheral.
    ///
    /// Need not be derived from language-level identity; a value
    /// synthesized from stable fields is expected, so that the hash
    /// survives handle re-creation across scans.
    fn peripheral_hash(&self, peripheral: &Self::Peripheral) -> u64;

    /// Decide whether a newly attached peripheral connects on this
    /// scan pass or through the deferred queue.
    fn attach_policy(&mut self, _peripheral: &Self::Peripheral) -> AttachPolicy {
        AttachPolicy::Connect
    }

    /// Initialize the peripheral and produce its I/O device.
    ///
    /// An error quarantines the peripheral until it is physically
    /// detached, at which point a reconnect may be retried.
    fn setup(&mut self, peripheral: &Self::Peripheral) -> Result<Self::Device, BackendError>;

    /// Tear down a disconnecting peripheral, taking its device back.
    ///
    /// Errors are reported via [`shutdown_failed`](Self::shutdown_failed)
    /// and never propagate; disconnection has already happened.
    fn shutdown(
        &mut self,
        _peripheral: &Self::Peripheral,
        _device: Self::Device,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Called once per seek cycle after the scan pass; returns the
    /// outcomes of deferred connection attempts that resolved.
    fn poll_deferred(&mut self) -> Vec<DeferredAttach<Self::Peripheral>> {
        Vec::new()
    }

    /// Notification: the peripheral left the attached set. Backends
    /// with deferred-connect state must drop any pending entry here.
    fn peripheral_detached(&mut self, _peripheral: &Self::Peripheral) {}

    /// Notification: the peripheral was quarantined.
    fn peripheral_blocked(&mut self, _peripheral: &Self::Peripheral) {}

    /// Notification: the peripheral's quarantine was lifted.
    fn peripheral_unblocked(&mut self, _peripheral: &Self::Peripheral) {}

    /// Notification: setup failed; the engine is about to quarantine.
    fn setup_failed(&mut self, _peripheral: &Self::Peripheral, _cause: &BackendError) {}

    /// Notification: shutdown failed; the error goes no further.
    fn shutdown_failed(&mut self, _peripheral: &Self::Peripheral, _cause: &BackendError) {}
}
