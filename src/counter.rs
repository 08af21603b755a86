//! Minimal progress counters.
//!
//! The spec's non-goals rule out request-queue pipelining sized from a
//! measured bandwidth-delay product (cratetorrent's own `Counter` type
//! feeds exactly that calculation), so this keeps only the ambient part:
//! plain monotonic counters for progress logging, shared the same way
//! other per-torrent state is (behind an `Arc`, incremented from whichever
//! peer session task last touched it).

use std::sync::atomic::{AtomicU64, Ordering};

/// A simple thread-safe monotonic counter.
#[derive(Default, Debug)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    /// Adds `n` to the counter and returns the new total.
    pub fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Returns the counter's current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-torrent download progress, used for logging and eventually exposed
/// to callers as torrent stats.
#[derive(Default, Debug)]
pub(crate) struct TorrentCounters {
    /// Total block payload bytes received (including fragments later
    /// discarded due to a hash mismatch).
    pub downloaded_bytes: Counter,
    /// Number of pieces that have passed hash verification.
    pub downloaded_pieces: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_returns_running_total() {
        let counter = Counter::default();
        assert_eq!(counter.add(5), 5);
        assert_eq!(counter.add(3), 8);
        assert_eq!(counter.get(), 8);
    }

    #[test]
    fn torrent_counters_track_independently() {
        let counters = TorrentCounters::default();
        counters.downloaded_bytes.add(16384);
        counters.downloaded_pieces.add(1);
        assert_eq!(counters.downloaded_bytes.get(), 16384);
        assert_eq!(counters.downloaded_pieces.get(), 1);
    }
}
