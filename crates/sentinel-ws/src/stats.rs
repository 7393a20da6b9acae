//! Feed counters.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Lock-free counters for one feed.
#[derive(Debug, Default)]
pub struct FeedStats {
    frames_received: AtomicU64,
    frames_processed: AtomicU64,
    frames_dropped: AtomicU64,
    processing_errors: AtomicU64,
    connects: AtomicU64,
    reconnects: AtomicU64,
    connection_errors: AtomicU64,
    /// Epoch ms of the last frame received, 0 if none.
    last_frame_ms: AtomicI64,
}

impl FeedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, now_ms: i64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.last_frame_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped frame, returning the new total.
    pub fn record_dropped(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn processing_errors(&self) -> u64 {
        self.processing_errors.load(Ordering::Relaxed)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FeedStatsSnapshot {
        let last = self.last_frame_ms.load(Ordering::Relaxed);
        FeedStatsSnapshot {
            frames_received: self.frames_received(),
            frames_processed: self.frames_processed(),
            frames_dropped: self.frames_dropped(),
            processing_errors: self.processing_errors(),
            connects: self.connects(),
            reconnects: self.reconnects(),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            last_frame_ms: (last > 0).then_some(last),
        }
    }
}

/// Point-in-time copy of [`FeedStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedStatsSnapshot {
    pub frames_received: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub processing_errors: u64,
    pub connects: u64,
    pub reconnects: u64,
    pub connection_errors: u64,
    pub last_frame_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = FeedStats::new();
        stats.record_received(1_000);
        stats.record_received(2_000);
        stats.record_processed();
        assert_eq!(stats.record_dropped(), 1);
        assert_eq!(stats.record_dropped(), 2);
        stats.record_processing_error();
        stats.record_reconnect();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.frames_processed, 1);
        assert_eq!(snap.frames_dropped, 2);
        assert_eq!(snap.processing_errors, 1);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.last_frame_ms, Some(2_000));
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = FeedStats::new().snapshot();
        assert_eq!(snap.frames_received, 0);
        assert_eq!(snap.last_frame_ms, None);
    }
}
