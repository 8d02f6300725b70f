//! Collector counters.
//!
//! One `CollectorStats` is created per collector and shared by every worker
//! through an `Arc`. Counters are monotonic and only reset by restarting the
//! process.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic, lock-free collector counters.
#[derive(Debug, Default)]
pub struct CollectorStats {
    received: AtomicU64,
    stored: AtomicU64,
    overflowed_on_error: AtomicU64,
    overflowed_on_timeout: AtomicU64,
    read_failures: AtomicU64,
    requeued: AtomicU64,
    queue_full_overflows: AtomicU64,
    overflow_failures: AtomicU64,
    completed_after_timeout: AtomicU64,
    dropped_on_shutdown: AtomicU64,
}

/// Point-in-time copy of [`CollectorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Datum accepted by `store`
    pub received: u64,

    /// Datum persisted by the backing store within the wait budget
    pub stored: u64,

    /// Datum overflowed because the backing store failed
    pub overflowed_on_error: u64,

    /// Datum overflowed because the backing store exceeded the wait budget
    pub overflowed_on_timeout: u64,

    /// Queue messages that could not be read or decoded
    pub read_failures: u64,

    /// Queue messages accepted back into the work queue
    pub requeued: u64,

    /// `store` calls routed straight to overflow because the work queue was full
    pub queue_full_overflows: u64,

    /// Overflow sends that failed
    pub overflow_failures: u64,

    /// Timed-out backing store calls that later succeeded
    pub completed_after_timeout: u64,

    /// Work items abandoned at the shutdown deadline
    pub dropped_on_shutdown: u64,
}

impl StatsSnapshot {
    /// Counters as `(name, value)` pairs.
    pub fn named(&self) -> [(&'static str, u64); 10] {
        [
            ("received", self.received),
            ("stored", self.stored),
            ("overflowedOnError", self.overflowed_on_error),
            ("overflowedOnTimeout", self.overflowed_on_timeout),
            ("readFailures", self.read_failures),
            ("requeued", self.requeued),
            ("queueFullOverflows", self.queue_full_overflows),
            ("overflowFailures", self.overflow_failures),
            ("completedAfterTimeout", self.completed_after_timeout),
            ("droppedOnShutdown", self.dropped_on_shutdown),
        ]
    }
}

impl CollectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflowed_on_error(&self) {
        self.overflowed_on_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflowed_on_timeout(&self) {
        self.overflowed_on_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full_overflow(&self) {
        self.queue_full_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow_failure(&self) {
        self.overflow_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed_after_timeout(&self) {
        self.completed_after_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_on_shutdown(&self, count: u64) {
        self.dropped_on_shutdown.fetch_add(count, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            overflowed_on_error: self.overflowed_on_error.load(Ordering::Relaxed),
            overflowed_on_timeout: self.overflowed_on_timeout.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            queue_full_overflows: self.queue_full_overflows.load(Ordering::Relaxed),
            overflow_failures: self.overflow_failures.load(Ordering::Relaxed),
            completed_after_timeout: self.completed_after_timeout.load(Ordering::Relaxed),
            dropped_on_shutdown: self.dropped_on_shutdown.load(Ordering::Relaxed),
        }
    }
}
