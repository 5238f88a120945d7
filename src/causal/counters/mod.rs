//! Anomaly counters for the causal log layers.
//!
//! Stale deltas, unknown consumers and out-of-depth recovery requests
//! are handled locally and only surface here; they are never `Err`
//! paths.

use std::sync::atomic::{AtomicU64, Ordering};

/// Relaxed counters shared by every component of one job causal log.
#[derive(Debug, Default)]
pub struct LogCounters {
    stale_deltas: AtomicU64,
    unknown_consumers: AtomicU64,
    filtered_requests: AtomicU64,
    reclaimed_slices: AtomicU64,
}

impl LogCounters {
    /// Returns a fresh set of counters, all zero.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn count_stale_delta(&self) {
        self.stale_deltas.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_unknown_consumer(&self) {
        self.unknown_consumers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_filtered_request(&self) {
        self.filtered_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_reclaimed_slices(&self, n: usize) {
        self.reclaimed_slices.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Number of upstream deltas discarded because the receiver had
    /// already advanced past their bytes or their epoch.
    pub fn stale_deltas(&self) -> u64 {
        self.stale_deltas.load(Ordering::Relaxed)
    }

    /// Number of delta reads that lazily created a consumer cursor.
    pub fn unknown_consumers(&self) -> u64 {
        self.unknown_consumers.load(Ordering::Relaxed)
    }

    /// Number of recovery requests refused by the sharing depth filter.
    pub fn filtered_requests(&self) -> u64 {
        self.filtered_requests.load(Ordering::Relaxed)
    }

    /// Number of epoch slices reclaimed by completed checkpoints.
    pub fn reclaimed_slices(&self) -> u64 {
        self.reclaimed_slices.load(Ordering::Relaxed)
    }
}
