//! Wake leases
//!
//! Host platforms that suspend idle processes let a component hold the CPU
//! awake for the duration of a critical section. `WakeLock` is that host
//! facility; `WakeLease` is a scoped hold on it that must be released on
//! every continuation path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Host facility that keeps the process awake while held
pub trait WakeLock: Send + Sync {
    fn acquire(&self, tag: &str);
    fn release(&self, tag: &str);
}

/// A held wake lock
///
/// Call [`WakeLease::release`] explicitly. Dropping an unreleased lease
/// releases it too, but logs a warning since that means a code path forgot.
#[must_use = "a wake lease must be released"]
pub struct WakeLease {
    lock: Arc<dyn WakeLock>,
    tag: String,
    released: bool,
}

impl WakeLease {
    pub fn acquire(lock: Arc<dyn WakeLock>, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        lock.acquire(&tag);
        trace!(tag = %tag, "Wake lease acquired");
        Self {
            lock,
            tag,
            released: false,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.lock.release(&self.tag);
            trace!(tag = %self.tag, "Wake lease released");
        }
    }
}

impl Drop for WakeLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(tag = %self.tag, "Wake lease dropped without explicit release");
            self.release_inner();
        }
    }
}

/// Wake lock for hosts without power management
///
/// Tracks how many leases are outstanding so leaks show up in tests and logs.
#[derive(Debug, Default)]
pub struct CountingWakeLock {
    held: AtomicUsize,
    acquired_total: AtomicUsize,
}

impl CountingWakeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    pub fn acquired_total(&self) -> usize {
        self.acquired_total.load(Ordering::SeqCst)
    }
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self, _tag: &str) {
        self.held.fetch_add(1, Ordering::SeqCst);
        self.acquired_total.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, tag: &str) {
        let previous = self
            .held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous.is_err() {
            warn!(tag, "Wake lock released more times than acquired");
        }
    }
}
