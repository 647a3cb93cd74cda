//! In-memory metrics for monitoring control-plane health.
//!
//! Lock-free atomic counters; single writer per event source, any number of
//! readers via `snapshot()`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

/// Control-plane counters - all fields are atomic for thread-safe access.
pub struct Metrics {
    // Job counters
    pub jobs_enqueued: AtomicU64,
    pub jobs_dispatched: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_requeued: AtomicU64,
    pub jobs_rejected: AtomicU64,

    // Worker counters
    pub workers_registered: AtomicU64,
    pub workers_evicted: AtomicU64,

    // Relay counters
    pub relay_requests: AtomicU64,
    pub relay_timeouts: AtomicU64,

    // Error counters
    pub protocol_errors: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_enqueued: AtomicU64::new(0),
            jobs_dispatched: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_requeued: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
            workers_registered: AtomicU64::new(0),
            workers_evicted: AtomicU64::new(0),
            relay_requests: AtomicU64::new(0),
            relay_timeouts: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            storage_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_jobs_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_requeued(&self) {
        self.jobs_requeued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_workers_registered(&self) {
        self.workers_registered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_workers_evicted(&self) {
        self.workers_evicted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_relay_requests(&self) {
        self.relay_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_relay_timeouts(&self) {
        self.relay_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_storage_errors(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_requeued: self.jobs_requeued.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            workers_registered: self.workers_registered.load(Ordering::Relaxed),
            workers_evicted: self.workers_evicted.load(Ordering::Relaxed),
            relay_requests: self.relay_requests.load(Ordering::Relaxed),
            relay_timeouts: self.relay_timeouts.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of counters for reading.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_dispatched: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
    pub jobs_rejected: u64,
    pub workers_registered: u64,
    pub workers_evicted: u64,
    pub relay_requests: u64,
    pub relay_timeouts: u64,
    pub protocol_errors: u64,
    pub storage_errors: u64,
}
