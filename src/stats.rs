//! Per-handle transfer counters
//!
//! Stats are deliberately local to the handle, never stored in the shared
//! region: a shared counter would add a contended cache line to every
//! operation, and the header stays a pure control block.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of a handle's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub writes_count: u64,
    pub reads_count: u64,
    pub wait_timeouts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsTracker {
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    writes_count: AtomicU64,
    reads_count: AtomicU64,
    wait_timeouts: AtomicU64,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl StatsTracker {
    pub fn record_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.writes_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.reads_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: &crate::ArenaError) {
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            writes_count: self.writes_count.load(Ordering::Relaxed),
            reads_count: self.reads_count.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let tracker = StatsTracker::default();
        tracker.record_write(100);
        tracker.record_write(50);
        tracker.record_read(100);
        tracker.record_timeout();

        let snap = tracker.snapshot();
        assert_eq!(snap.bytes_written, 150);
        assert_eq!(snap.writes_count, 2);
        assert_eq!(snap.bytes_read, 100);
        assert_eq!(snap.reads_count, 1);
        assert_eq!(snap.wait_timeouts, 1);
    }

    #[test]
    fn test_last_error_is_kept() {
        let tracker = StatsTracker::default();
        assert!(tracker.last_error().is_none());
        tracker.record_error(&crate::ArenaError::Timeout);
        assert_eq!(tracker.last_error().unwrap(), "operation timed out");
    }
}
