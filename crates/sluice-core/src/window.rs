//! Per-partition event window
//!
//! Bounded, append-only in-memory buffer of captured events, shared by one
//! writer (the partition's producer) and N readers (dispatch loops and
//! subscribers). Readers at different offsets re-scan from their own
//! position; the writer is never blocked by readers.
//!
//! ## Retention
//!
//! - `capacity` is the soft target: once the window grows past it, entries
//!   acknowledged by every destination become evictable.
//! - `max_retained` is the hard cap: beyond it the oldest entry is dropped
//!   regardless of acknowledgement, and a reader still behind the drop point
//!   observes [`Error::WindowUnderflow`] and must fall back to a full resync.

use crate::error::{Error, Result};
use crate::model::{ChangeEvent, PhysicalPartition, Scn};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Bounded per-partition buffer of captured events.
pub struct EventWindow {
    partition: PhysicalPartition,
    /// Soft capacity: eviction of acknowledged entries starts past this.
    capacity: usize,
    /// Hard retention cap: the window never holds more entries than this.
    max_retained: usize,
    inner: RwLock<WindowInner>,
    append_notify: Notify,
}

struct WindowInner {
    events: VecDeque<ChangeEvent>,
    /// Highest scn ever appended; 0 = none.
    last_appended: Scn,
    /// Highest scn removed from the window; reads at or below this underflow.
    evicted_through: Scn,
}

impl EventWindow {
    /// Create a window for a partition that starts from scratch.
    pub fn new(partition: PhysicalPartition, capacity: usize, max_retained: usize) -> Self {
        Self::resuming_from(partition, capacity, max_retained, 0)
    }

    /// Create a window resuming after a capture checkpoint.
    ///
    /// The first accepted append is `checkpoint + 1`; reads at or below the
    /// checkpoint underflow because those events were never re-captured.
    pub fn resuming_from(
        partition: PhysicalPartition,
        capacity: usize,
        max_retained: usize,
        checkpoint: Scn,
    ) -> Self {
        let max_retained = max_retained.max(capacity).max(1);
        Self {
            partition,
            capacity: capacity.max(1),
            max_retained,
            inner: RwLock::new(WindowInner {
                events: VecDeque::new(),
                last_appended: checkpoint,
                evicted_through: checkpoint,
            }),
            append_notify: Notify::new(),
        }
    }

    /// Partition this window belongs to.
    pub fn partition(&self) -> &PhysicalPartition {
        &self.partition
    }

    /// Append the next event in sequence.
    ///
    /// Rejects any event whose scn is not exactly `last_appended + 1` with
    /// [`Error::SequenceGap`], leaving the window unchanged. Wakes readers
    /// blocked in [`wait_for`](Self::wait_for).
    pub fn append(&self, event: ChangeEvent) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let expected = inner.last_appended + 1;
            if event.scn != expected {
                return Err(Error::SequenceGap {
                    partition: self.partition.clone(),
                    expected,
                    got: event.scn,
                });
            }

            inner.last_appended = event.scn;
            inner.events.push_back(event);

            // Hard cap: drop the oldest entry even if unacknowledged.
            // Laggards behind the drop point underflow on their next read.
            while inner.events.len() > self.max_retained {
                if let Some(dropped) = inner.events.pop_front() {
                    inner.evicted_through = dropped.scn;
                    warn!(
                        "Window {}: retention cap {} reached, dropped scn {}",
                        self.partition, self.max_retained, dropped.scn
                    );
                }
            }
        }
        self.append_notify.notify_waiters();
        Ok(())
    }

    /// Remove the just-appended tail entry.
    ///
    /// Used by the producer when the capture-checkpoint write fails, so the
    /// tracker and the window never diverge. Returns true when the tail
    /// matched `scn` and was removed.
    pub fn rollback_last(&self, scn: Scn) -> bool {
        let mut inner = self.inner.write();
        match inner.events.back() {
            Some(tail) if tail.scn == scn => {
                inner.events.pop_back();
                inner.last_appended = scn - 1;
                debug!("Window {}: rolled back scn {}", self.partition, scn);
                true
            }
            _ => false,
        }
    }

    /// Read events with `scn >= from`, in order, up to `max` entries.
    ///
    /// Finite up to the current tail and restartable: each call re-scans
    /// from the requested position. A request at or below the eviction
    /// watermark fails with [`Error::WindowUnderflow`].
    pub fn read_from(&self, from: Scn, max: usize) -> Result<Vec<ChangeEvent>> {
        let inner = self.inner.read();
        if from <= inner.evicted_through {
            return Err(Error::WindowUnderflow {
                partition: self.partition.clone(),
                requested: from,
                oldest_retained: inner.evicted_through + 1,
            });
        }

        Ok(inner
            .events
            .iter()
            .skip_while(|e| e.scn < from)
            .take(max)
            .cloned()
            .collect())
    }

    /// Wait until an event with `scn` (or later) has been appended.
    ///
    /// Bounded wait with wake-on-append; returns false on timeout. Never
    /// busy-polls.
    pub async fn wait_for(&self, scn: Scn, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for notification before checking, so an append
            // between the check and the await cannot be missed.
            let notified = self.append_notify.notified();
            if self.last_scn() >= scn {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.last_scn() >= scn;
            }
        }
    }

    /// Evict acknowledged entries while the window is over its soft capacity.
    ///
    /// Removes oldest entries with `scn <= min_dispatch_scn` only; an entry
    /// not yet acknowledged by every destination is never removed here.
    /// Returns the number of entries evicted.
    pub fn evict_acknowledged(&self, min_dispatch_scn: Scn) -> usize {
        let mut inner = self.inner.write();
        let mut evicted = 0;
        while inner.events.len() > self.capacity {
            match inner.events.front() {
                Some(front) if front.scn <= min_dispatch_scn => {
                    let scn = front.scn;
                    inner.events.pop_front();
                    inner.evicted_through = scn;
                    evicted += 1;
                }
                _ => break,
            }
        }
        if evicted > 0 {
            debug!(
                "Window {}: evicted {} acknowledged entries through scn {}",
                self.partition, evicted, inner.evicted_through
            );
        }
        evicted
    }

    /// Highest appended scn (0 = none).
    pub fn last_scn(&self) -> Scn {
        self.inner.read().last_appended
    }

    /// Oldest retained scn, if the window holds any events.
    pub fn oldest_retained(&self) -> Option<Scn> {
        self.inner.read().events.front().map(|e| e.scn)
    }

    /// Highest scn removed from the window (0 = nothing removed).
    pub fn evicted_through(&self) -> Scn {
        self.inner.read().evicted_through
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    /// Whether the window holds no events.
    pub fn is_empty(&self) -> bool {
        self.inner.read().events.is_empty()
    }
}
