use crate::error::{Result, SeekError};

/// Single-slot callback invoked with a reference to a device.
pub type DeviceCallback<D> = Box<dyn FnMut(&D) + Send>;

/// Registry of discovered I/O devices, keyed by a stable hash.
///
/// Keys are supplied by the caller (typically the backend's peripheral
/// hash) rather than device identity, so a device re-created across
/// scans still maps to the same entry. Discovery and forgetting are
/// idempotent by key.
pub struct DeviceRegistry<D> {
    entries: Vec<(u64, D)>,
    on_discover: Option<DeviceCallback<D>>,
    on_forget: Option<DeviceCallback<D>>,
    closed: bool,
}

impl<D> DeviceRegistry<D> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            on_discover: None,
            on_forget: None,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SeekError::Closed);
        }
        Ok(())
    }

    /// Register a device under the given key.
    ///
    /// Returns `false` without firing any callback if the key is
    /// already present.
    pub fn discover(&mut self, key: u64, device: D) -> Result<bool> {
        self.ensure_open()?;
        if self.contains(key) {
            return Ok(false);
        }
        log::debug!("discovered device {key:#x}");
        if let Some(cb) = self.on_discover.as_mut() {
            cb(&device);
        }
        self.entries.push((key, device));
        Ok(true)
    }

    /// Remove the device registered under the given key, if any.
    ///
    /// Returns the removed device, which is the caller's release point
    /// for any native handle it owns.
    pub fn forget(&mut self, key: u64) -> Result<Option<D>> {
        self.ensure_open()?;
        let Some(position) = self.entries.iter().position(|(k, _)| *k == key) else {
            return Ok(None);
        };
        let (_, device) = self.entries.remove(position);
        log::debug!("forgot device {key:#x}");
        if let Some(cb) = self.on_forget.as_mut() {
            cb(&device);
        }
        Ok(Some(device))
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }

    pub fn get(&self, key: u64) -> Option<&D> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, d)| d)
    }

    /// Iterate over registered devices in discovery order.
    pub fn devices(&self) -> impl Iterator<Item = &D> {
        self.entries.iter().map(|(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set or clear the discovery callback.
    pub fn set_on_discover(&mut self, callback: Option<DeviceCallback<D>>) -> Result<()> {
        self.ensure_open()?;
        self.on_discover = callback;
        Ok(())
    }

    /// Set or clear the forget callback.
    pub fn set_on_forget(&mut self, callback: Option<DeviceCallback<D>>) -> Result<()> {
        self.ensure_open()?;
        self.on_forget = callback;
        Ok(())
    }

    /// Forget every device, clear callbacks and mark the registry
    /// closed. Forget notifications fire for each device. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        while let Some((key, device)) = self.entries.pop() {
            log::debug!("forgot device {key:#x}");
            if let Some(cb) = self.on_forget.as_mut() {
                cb(&device);
            }
        }
        self.on_discover = None;
        self.on_forget = None;
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<D> Default for DeviceRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::DeviceRegistry;
    use crate::error::SeekError;

    #[test]
    fn discover_is_idempotent_by_key() {
        let mut registry = DeviceRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_c = hits.clone();
        registry
            .set_on_discover(Some(Box::new(move |_: &&str| {
                hits_c.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        assert!(registry.discover(1, "gamepad").unwrap());
        assert!(!registry.discover(1, "gamepad").unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn forget_is_symmetric_and_idempotent() {
        let mut registry = DeviceRegistry::new();
        registry.discover(7, "wheel").unwrap();

        assert_eq!(registry.forget(7).unwrap(), Some("wheel"));
        assert_eq!(registry.forget(7).unwrap(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn close_forgets_everything_and_rejects_mutation() {
        let mut registry = DeviceRegistry::new();
        let forgotten = Arc::new(AtomicUsize::new(0));
        let forgotten_c = forgotten.clone();
        registry
            .set_on_forget(Some(Box::new(move |_: &&str| {
                forgotten_c.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        registry.discover(1, "a").unwrap();
        registry.discover(2, "b").unwrap();

        registry.close();
        assert_eq!(forgotten.load(Ordering::SeqCst), 2);
        assert!(registry.is_closed());
        assert!(matches!(registry.discover(3, "c"), Err(SeekError::Closed)));
        assert!(matches!(registry.forget(1), Err(SeekError::Closed)));

        // Closing again is a no-op.
        registry.close();
        assert_eq!(forgotten.load(Ordering::SeqCst), 2);
    }
}
