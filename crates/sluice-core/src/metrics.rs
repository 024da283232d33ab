//! Relay observability
//!
//! Lock-free counters shared across producers and dispatch loops, with a
//! consistent snapshot for health surfaces. Counters only — export
//! formatting is out of scope.

use crate::model::EventOp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay metrics collector with atomic counters for lock-free updates.
#[derive(Debug)]
pub struct RelayMetrics {
    start_time: Instant,

    // Capture side
    events_captured: AtomicU64,
    capture_errors: AtomicU64,

    // Dispatch side
    events_dispatched: AtomicU64,
    dispatch_errors: AtomicU64,
    upserts_applied: AtomicU64,
    deletes_applied: AtomicU64,
    dead_lettered: AtomicU64,

    // Window
    events_evicted: AtomicU64,

    // Resilience
    retries: AtomicU64,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            events_captured: AtomicU64::new(0),
            capture_errors: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            dispatch_errors: AtomicU64::new(0),
            upserts_applied: AtomicU64::new(0),
            deletes_applied: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            events_evicted: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Record a captured event.
    #[inline]
    pub fn record_captured(&self) {
        self.events_captured.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a capture-side failure.
    #[inline]
    pub fn record_capture_error(&self) {
        self.capture_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully dispatched event.
    #[inline]
    pub fn record_dispatched(&self, op: EventOp) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        match op {
            EventOp::Upsert => self.upserts_applied.fetch_add(1, Ordering::Relaxed),
            EventOp::Delete => self.deletes_applied.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a dispatch-side failure.
    #[inline]
    pub fn record_dispatch_error(&self) {
        self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dead-lettered event.
    #[inline]
    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record evicted window entries.
    #[inline]
    pub fn record_evicted(&self, count: u64) {
        self.events_evicted.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a retry attempt.
    #[inline]
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent snapshot of all counters.
    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        let uptime = self.start_time.elapsed();
        let events_captured = self.events_captured.load(Ordering::Relaxed);
        RelayMetricsSnapshot {
            uptime_secs: uptime.as_secs_f64(),
            events_captured,
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            upserts_applied: self.upserts_applied.load(Ordering::Relaxed),
            deletes_applied: self.deletes_applied.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            events_evicted: self.events_evicted.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            capture_rate: if uptime.as_secs_f64() > 0.0 {
                events_captured as f64 / uptime.as_secs_f64()
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time view of relay metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMetricsSnapshot {
    pub uptime_secs: f64,
    pub events_captured: u64,
    pub capture_errors: u64,
    pub events_dispatched: u64,
    pub dispatch_errors: u64,
    pub upserts_applied: u64,
    pub deletes_applied: u64,
    pub dead_lettered: u64,
    pub events_evicted: u64,
    pub retries: u64,
    /// Captured events per second since start
    pub capture_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = RelayMetrics::new();

        metrics.record_captured();
        metrics.record_captured();
        metrics.record_dispatched(EventOp::Upsert);
        metrics.record_dispatched(EventOp::Delete);
        metrics.record_dispatched(EventOp::Delete);
        metrics.record_dead_lettered();
        metrics.record_evicted(4);
        metrics.record_retry();

        let snap = metrics.snapshot();
        assert_eq!(snap.events_captured, 2);
        assert_eq!(snap.events_dispatched, 3);
        assert_eq!(snap.upserts_applied, 1);
        assert_eq!(snap.deletes_applied, 2);
        assert_eq!(snap.dead_lettered, 1);
        assert_eq!(snap.events_evicted, 4);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.capture_errors, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        let metrics = Arc::new(RelayMetrics::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_captured();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.snapshot().events_captured, 4000);
    }
}
