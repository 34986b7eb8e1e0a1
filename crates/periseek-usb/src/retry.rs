use std::time::{Duration, Instant};

/// How many times a device open is attempted before quarantine.
pub const OPEN_ATTEMPTS: u8 = 3;
/// Minimum spacing between open attempts for the same device.
pub const RETRY_DELAY: Duration = Duration::from_millis(1000);

/// A device waiting for its next open attempt.
#[derive(Debug)]
pub(crate) struct PendingOpen<P> {
    pub(crate) peripheral: P,
    pub(crate) attempts_left: u8,
    pub(crate) last_attempt: Option<Instant>,
}

/// Queue of devices whose open attempts are being spaced out.
///
/// Entries start with [`OPEN_ATTEMPTS`] attempts. `take_ready` hands
/// out the entries due for a try; failed tries go back through
/// `requeue`, which returns the entry instead once its attempts are
/// exhausted.
#[derive(Debug)]
pub(crate) struct RetryQueue<P> {
    entries: Vec<PendingOpen<P>>,
}

impl<P> RetryQueue<P> {
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub(crate) fn push(&mut self, peripheral: P) {
        self.entries.push(PendingOpen {
            peripheral,
            attempts_left: OPEN_ATTEMPTS,
            last_attempt: None,
        });
    }

    /// Drop every entry matching the predicate.
    pub(crate) fn remove_where(&mut self, mut predicate: impl FnMut(&P) -> bool) {
        self.entries.retain(|entry| !predicate(&entry.peripheral));
    }

    /// Take the entries whose retry delay has elapsed.
    pub(crate) fn take_ready(&mut self, now: Instant) -> Vec<PendingOpen<P>> {
        let mut ready = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            let due = self.entries[index]
                .last_attempt
                .map_or(true, |at| now.duration_since(at) >= RETRY_DELAY);
            if due {
                ready.push(self.entries.remove(index));
            } else {
                index += 1;
            }
        }
        ready
    }

    /// Put a failed entry back, consuming one attempt.
    ///
    /// Returns the entry instead when no attempts remain.
    pub(crate) fn requeue(&mut self, mut entry: PendingOpen<P>, now: Instant) -> Option<PendingOpen<P>> {
        entry.attempts_left -= 1;
        if entry.attempts_left == 0 {
            return Some(entry);
        }
        entry.last_attempt = Some(now);
        self.entries.push(entry);
        None
    }
}
