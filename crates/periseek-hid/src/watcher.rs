use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHashSet;
use crossbeam_channel::Sender;
use hidapi::HidApi;

use crate::backend::HidPeripheral;

/// Event emitted by the enumeration thread.
#[derive(Debug)]
pub(crate) enum HidEvent {
    Attached(HidPeripheral),
    Detached(CString),
    Error(String),
}

/// Background thread re-enumerating the HID bus at a fixed interval.
///
/// Emits attach/detach deltas over a channel; the backend folds them
/// into its presence snapshot on the seek thread. Enumeration errors
/// are forwarded as events rather than killing the thread.
pub(crate) struct HidWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HidWatcher {
    pub(crate) fn spawn(
        api: Arc<Mutex<HidApi>>,
        tx: Sender<HidEvent>,
        poll_interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut known: Vec<HidPeripheral> = Vec::new();
            while !stop_flag.load(Ordering::Relaxed) {
                match enumerate(&api) {
                    Ok(present) => {
                        for event in diff_present(&known, &present) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        known = present;
                    }
                    Err(message) => {
                        if tx.send(HidEvent::Error(message)).is_err() {
                            return;
                        }
                    }
                }
                thread::sleep(poll_interval);
            }
        });
        Self { stop, handle: Some(handle) }
    }
}

impl Drop for HidWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn enumerate(api: &Arc<Mutex<HidApi>>) -> Result<Vec<HidPeripheral>, String> {
    let Ok(mut api) = api.lock() else {
        return Err("hidapi lock poisoned".to_owned());
    };
    api.refresh_devices().map_err(|e| e.to_string())?;
    Ok(api.device_list().map(HidPeripheral::from_info).collect())
}

/// Compute attach/detach events between two presence snapshots,
/// keyed by platform device path.
fn diff_present(known: &[HidPeripheral], present: &[HidPeripheral]) -> Vec<HidEvent> {
    let known_paths: AHashSet<&CStr> = known.iter().map(|p| p.path.as_c_str()).collect();
    let present_paths: AHashSet<&CStr> = present.iter().map(|p| p.path.as_c_str()).collect();

    let mut events = Vec::new();
    for peripheral in known {
        if !present_paths.contains(peripheral.path.as_c_str()) {
            events.push(HidEvent::Detached(peripheral.path.clone()));
        }
    }
    for peripheral in present {
        if !known_paths.contains(peripheral.path.as_c_str()) {
            events.push(HidEvent::Attached(peripheral.clone()));
        }
    }
    events
}
