//! Diagnostic counters for one listener.
//!
//! Counters live as long as the listener that owns them and are only reset
//! by a restart. Handlers may run on several tasks at once, so every update
//! is an atomic increment.

use std::sync::atomic::{AtomicU64, Ordering};

/// Listener counters.
#[derive(Debug, Default)]
pub struct Counters {
    total: AtomicU64,
    sent: AtomicU64,
    accept_failures: AtomicU64,
}

/// A point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Frames received, one per accepted connection.
    pub total: u64,
    /// Echo responses written in full.
    pub sent: u64,
    /// Accept errors that were logged and skipped.
    pub accept_failures: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accept_failure(&self) {
        self.accept_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            total: self.total.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            accept_failures: self.accept_failures.load(Ordering::Relaxed),
        }
    }
}
