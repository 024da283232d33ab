//! Dispatch loops
//!
//! One loop per (partition × destination) pair delivers ordered events from
//! the partition's window to one data layer, advancing the dispatch
//! checkpoint after each acknowledged apply. Loops progress independently:
//! a slow destination never blocks a fast one.
//!
//! Error classification:
//! - validation errors follow the configured policy — halt-and-alert by
//!   default, optional dead-letter skip that records the event and advances
//! - transient errors retry the same event with bounded exponential backoff
//! - window underflow fails the loop; the consumer's resync path is outside
//!   this core

use sluice_core::{
    ChangeEvent, CheckpointRole, DispatchSettings, Error as CoreError, EventWindow,
    PhysicalPartition, RelayMetrics, RetryConfig, SequenceTracker, ValidationErrorPolicy,
};
use sluice_datalayer::DataLayer;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Dispatch loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Reading the checkpoint
    Starting,
    /// Delivering events
    Running,
    /// Stopped cleanly
    Stopped,
    /// Failed; requires operator attention (or consumer resync)
    Failed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One dead-lettered event.
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    /// The event the destination rejected
    pub event: ChangeEvent,
    /// Destination that rejected it
    pub destination: String,
    /// Rejection reason
    pub reason: String,
    /// When it was recorded (epoch milliseconds)
    pub recorded_at: i64,
}

/// Bounded in-memory store of skipped events.
///
/// Holds the most recent `capacity` records; the total counter keeps
/// counting past evicted ones.
pub struct DeadLetterQueue {
    records: parking_lot::Mutex<VecDeque<DeadLetterRecord>>,
    capacity: usize,
    total: AtomicU64,
}

impl DeadLetterQueue {
    /// Create a queue retaining up to `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: parking_lot::Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            total: AtomicU64::new(0),
        }
    }

    /// Record a skipped event.
    pub fn record(&self, record: DeadLetterRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Remove and return all retained records.
    pub fn drain(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().drain(..).collect()
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no records are retained.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Total records ever recorded, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

enum ApplyOutcome {
    Advanced,
    Shutdown,
    Failed,
}

/// Worker delivering one partition's events to one destination.
pub struct DispatchLoop {
    partition: PhysicalPartition,
    destination: String,
    window: Arc<EventWindow>,
    tracker: Arc<SequenceTracker>,
    layer: Arc<dyn DataLayer>,
    settings: DispatchSettings,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<RelayMetrics>,
    state: Arc<RwLock<DispatchState>>,
}

impl DispatchLoop {
    /// Create a dispatch loop for one (partition, destination) pair.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition: PhysicalPartition,
        destination: impl Into<String>,
        window: Arc<EventWindow>,
        tracker: Arc<SequenceTracker>,
        layer: Arc<dyn DataLayer>,
        settings: DispatchSettings,
        dead_letters: Arc<DeadLetterQueue>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            partition,
            destination: destination.into(),
            window,
            tracker,
            layer,
            settings,
            dead_letters,
            metrics,
            state: Arc::new(RwLock::new(DispatchState::Starting)),
        }
    }

    /// Shared state handle for health checks; grab before calling `run`.
    pub fn state_handle(&self) -> Arc<RwLock<DispatchState>> {
        self.state.clone()
    }

    async fn set_state(&self, state: DispatchState) {
        *self.state.write().await = state;
        debug!(
            "Dispatch '{}' -> '{}' state {}",
            self.partition, self.destination, state
        );
    }

    /// Run the dispatch loop until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        self.set_state(DispatchState::Starting).await;
        let role = CheckpointRole::dispatch(self.destination.clone());

        let checkpoint = match self.tracker.get(&self.partition, &role).await {
            Ok(cp) => cp.unwrap_or(0),
            Err(e) => {
                error!(
                    "Dispatch '{}' -> '{}': cannot read checkpoint: {} (alert)",
                    self.partition, self.destination, e
                );
                self.set_state(DispatchState::Failed).await;
                return;
            }
        };
        let mut next = checkpoint + 1;
        info!(
            "Dispatch '{}' -> '{}' resuming at scn {}",
            self.partition, self.destination, next
        );

        self.set_state(DispatchState::Running).await;
        let retry = self.settings.retry.to_retry_config();

        'dispatch: loop {
            let batch = match self.window.read_from(next, self.settings.batch_size) {
                Ok(batch) => batch,
                Err(e @ CoreError::WindowUnderflow { .. }) => {
                    error!(
                        "Dispatch '{}' -> '{}': {} — destination must resync (alert)",
                        self.partition, self.destination, e
                    );
                    self.set_state(DispatchState::Failed).await;
                    return;
                }
                Err(e) => {
                    error!(
                        "Dispatch '{}' -> '{}': window read failed: {} (alert)",
                        self.partition, self.destination, e
                    );
                    self.set_state(DispatchState::Failed).await;
                    return;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break 'dispatch,
                    _ = self.window.wait_for(next, self.settings.wait()) => {}
                }
                continue;
            }

            for event in batch {
                match self.apply_one(&event, &role, &retry, &mut shutdown).await {
                    ApplyOutcome::Advanced => next = event.scn + 1,
                    ApplyOutcome::Shutdown => break 'dispatch,
                    ApplyOutcome::Failed => {
                        self.set_state(DispatchState::Failed).await;
                        return;
                    }
                }

                // Shutdown is observed between events, after the in-flight
                // apply has completed and checkpointed.
                match shutdown.try_recv() {
                    Err(broadcast::error::TryRecvError::Empty) => {}
                    _ => break 'dispatch,
                }
            }
        }

        self.set_state(DispatchState::Stopped).await;
        info!(
            "Dispatch '{}' -> '{}' stopped",
            self.partition, self.destination
        );
    }

    /// Apply one event and advance the dispatch checkpoint.
    async fn apply_one(
        &self,
        event: &ChangeEvent,
        role: &CheckpointRole,
        retry: &RetryConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ApplyOutcome {
        let mut applied = false;
        let mut attempt = 0u32;
        loop {
            match self.layer.apply(event).await {
                Ok(_ack) => {
                    applied = true;
                    break;
                }
                Err(e) if e.is_validation() => match self.settings.on_validation_error {
                    ValidationErrorPolicy::HaltAndAlert => {
                        self.metrics.record_dispatch_error();
                        error!(
                            "Dispatch '{}' -> '{}': validation error at scn {}: {} — halting (alert)",
                            self.partition, self.destination, event.scn, e
                        );
                        return ApplyOutcome::Failed;
                    }
                    ValidationErrorPolicy::DeadLetter => {
                        warn!(
                            "Dispatch '{}' -> '{}': dead-lettering scn {}: {}",
                            self.partition, self.destination, event.scn, e
                        );
                        self.dead_letters.record(DeadLetterRecord {
                            event: event.clone(),
                            destination: self.destination.clone(),
                            reason: e.to_string(),
                            recorded_at: chrono::Utc::now().timestamp_millis(),
                        });
                        self.metrics.record_dead_lettered();
                        break;
                    }
                },
                Err(e) if e.is_retryable() => {
                    self.metrics.record_dispatch_error();
                    if retry.should_retry(attempt) {
                        let delay = retry.delay_for_attempt(attempt);
                        attempt += 1;
                        self.metrics.record_retry();
                        warn!(
                            "Dispatch '{}' -> '{}': transient error at scn {} ({}), retry in {:?}",
                            self.partition, self.destination, event.scn, e, delay
                        );
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => return ApplyOutcome::Shutdown,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        error!(
                            "Dispatch '{}' -> '{}': retries exhausted at scn {}: {} (alert)",
                            self.partition, self.destination, event.scn, e
                        );
                        return ApplyOutcome::Failed;
                    }
                }
                Err(e) => {
                    self.metrics.record_dispatch_error();
                    error!(
                        "Dispatch '{}' -> '{}': fatal error at scn {}: {} (alert)",
                        self.partition, self.destination, event.scn, e
                    );
                    return ApplyOutcome::Failed;
                }
            }
        }

        // Advance the checkpoint; the event is only considered delivered
        // once this succeeds. Redelivery after a crash here is safe because
        // apply is idempotent.
        let mut attempt = 0u32;
        loop {
            match self.tracker.set(&self.partition, role, event.scn).await {
                Ok(()) => {
                    if applied {
                        self.metrics.record_dispatched(event.op);
                    }
                    return ApplyOutcome::Advanced;
                }
                Err(e) if e.is_retriable() && retry.should_retry(attempt) => {
                    let delay = retry.delay_for_attempt(attempt);
                    attempt += 1;
                    self.metrics.record_retry();
                    warn!(
                        "Dispatch '{}' -> '{}': checkpoint write failed at scn {} ({}), retry in {:?}",
                        self.partition, self.destination, event.scn, e, delay
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => return ApplyOutcome::Shutdown,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        "Dispatch '{}' -> '{}': checkpoint write failed at scn {}: {} (alert)",
                        self.partition, self.destination, event.scn, e
                    );
                    return ApplyOutcome::Failed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use sluice_datalayer::{Ack, DataLayerError, MemoryDataLayer};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn partition() -> PhysicalPartition {
        PhysicalPartition::new("orders", 0)
    }

    fn event(scn: u64) -> ChangeEvent {
        ChangeEvent::upsert(partition(), scn, "orders", format!("k-{scn}"), json!({"scn": scn}))
    }

    fn fast_settings(policy: ValidationErrorPolicy) -> DispatchSettings {
        DispatchSettings {
            batch_size: 16,
            wait_ms: 10,
            on_validation_error: policy,
            retry: sluice_core::RetrySettings {
                max_retries: 2,
                retry_delay_ms: 1,
                max_delay_ms: 5,
                jitter: 0.0,
            },
        }
    }

    /// Records applied scns; optionally fails the first N applies.
    struct CountingLayer {
        applied: StdMutex<Vec<u64>>,
        failures_remaining: StdMutex<u32>,
    }

    impl CountingLayer {
        fn new(transient_failures: u32) -> Arc<Self> {
            Arc::new(Self {
                applied: StdMutex::new(Vec::new()),
                failures_remaining: StdMutex::new(transient_failures),
            })
        }

        fn applied(&self) -> Vec<u64> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DataLayer for CountingLayer {
        fn destination(&self) -> &str {
            "counting"
        }

        async fn apply(&self, event: &ChangeEvent) -> sluice_datalayer::Result<Ack> {
            {
                let mut failures = self.failures_remaining.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(DataLayerError::transient("scripted failure"));
                }
            }
            self.applied.lock().unwrap().push(event.scn);
            Ok(Ack::at(event.scn))
        }
    }

    struct Harness {
        window: Arc<EventWindow>,
        tracker: Arc<SequenceTracker>,
        dead_letters: Arc<DeadLetterQueue>,
        metrics: Arc<RelayMetrics>,
        shutdown_tx: broadcast::Sender<()>,
    }

    impl Harness {
        fn new() -> Self {
            let (shutdown_tx, _) = broadcast::channel(4);
            Self {
                window: Arc::new(EventWindow::new(partition(), 64, 64)),
                tracker: Arc::new(SequenceTracker::in_memory()),
                dead_letters: Arc::new(DeadLetterQueue::new(16)),
                metrics: Arc::new(RelayMetrics::new()),
                shutdown_tx,
            }
        }

        fn spawn(
            &self,
            layer: Arc<dyn DataLayer>,
            policy: ValidationErrorPolicy,
        ) -> (Arc<RwLock<DispatchState>>, tokio::task::JoinHandle<()>) {
            let dispatch = DispatchLoop::new(
                partition(),
                "dest",
                self.window.clone(),
                self.tracker.clone(),
                layer,
                fast_settings(policy),
                self.dead_letters.clone(),
                self.metrics.clone(),
            );
            let state = dispatch.state_handle();
            let join = tokio::spawn(dispatch.run(self.shutdown_tx.subscribe()));
            (state, join)
        }

        async fn dispatch_checkpoint(&self) -> Option<u64> {
            self.tracker
                .get(&partition(), &CheckpointRole::dispatch("dest"))
                .await
                .unwrap()
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_delivers_in_order_and_checkpoints() {
        let harness = Harness::new();
        for scn in 1..=5 {
            harness.window.append(event(scn)).unwrap();
        }

        let layer = CountingLayer::new(0);
        let (state, join) = harness.spawn(layer.clone(), ValidationErrorPolicy::HaltAndAlert);

        {
            let layer = layer.clone();
            assert!(wait_until(move || layer.applied().len() == 5, Duration::from_secs(2)).await);
        }

        harness.shutdown_tx.send(()).unwrap();
        join.await.unwrap();

        assert_eq!(layer.applied(), vec![1, 2, 3, 4, 5]);
        assert_eq!(harness.dispatch_checkpoint().await, Some(5));
        assert_eq!(*state.read().await, DispatchState::Stopped);
        assert_eq!(harness.metrics.snapshot().events_dispatched, 5);
    }

    #[tokio::test]
    async fn test_crash_restart_resumes_exactly() {
        let harness = Harness::new();
        for scn in 1..=3 {
            harness.window.append(event(scn)).unwrap();
        }

        // First incarnation processes 1..=3, then "crashes" (shutdown)
        let first = CountingLayer::new(0);
        let (_, join) = harness.spawn(first.clone(), ValidationErrorPolicy::HaltAndAlert);
        {
            let first = first.clone();
            assert!(wait_until(move || first.applied().len() == 3, Duration::from_secs(2)).await);
        }
        harness.shutdown_tx.send(()).unwrap();
        join.await.unwrap();

        // More events arrive while the loop is down
        for scn in 4..=5 {
            harness.window.append(event(scn)).unwrap();
        }

        // Second incarnation resumes at exactly 4: never 1..=3, never skips 4
        let second = CountingLayer::new(0);
        let (_, join) = harness.spawn(second.clone(), ValidationErrorPolicy::HaltAndAlert);
        {
            let second = second.clone();
            assert!(wait_until(move || second.applied().len() == 2, Duration::from_secs(2)).await);
        }
        harness.shutdown_tx.send(()).unwrap();
        join.await.unwrap();

        assert_eq!(second.applied(), vec![4, 5]);
        assert_eq!(harness.dispatch_checkpoint().await, Some(5));
    }

    #[tokio::test]
    async fn test_validation_error_halts_by_default() {
        let harness = Harness::new();
        // Empty key fails memory-layer validation
        harness
            .window
            .append(ChangeEvent::upsert(partition(), 1, "orders", "", json!({})))
            .unwrap();

        let layer = Arc::new(MemoryDataLayer::new("dest"));
        let (state, join) = harness.spawn(layer, ValidationErrorPolicy::HaltAndAlert);
        join.await.unwrap();

        assert_eq!(*state.read().await, DispatchState::Failed);
        assert_eq!(harness.dispatch_checkpoint().await, None);
        assert!(harness.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_validation_error_dead_letters_when_configured() {
        let harness = Harness::new();
        harness
            .window
            .append(ChangeEvent::upsert(partition(), 1, "orders", "", json!({})))
            .unwrap();
        harness.window.append(event(2)).unwrap();

        let layer = Arc::new(MemoryDataLayer::new("dest"));
        let (state, join) = harness.spawn(layer.clone(), ValidationErrorPolicy::DeadLetter);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while harness.dispatch_checkpoint().await != Some(2)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(harness.dispatch_checkpoint().await, Some(2));

        harness.shutdown_tx.send(()).unwrap();
        join.await.unwrap();

        assert_eq!(*state.read().await, DispatchState::Stopped);
        assert_eq!(harness.dead_letters.len(), 1);
        let records = harness.dead_letters.drain();
        assert_eq!(records[0].event.scn, 1);
        // The good event was applied
        assert_eq!(layer.get("orders", "k-2"), Some(json!({"scn": 2})));
        assert_eq!(harness.metrics.snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_same_event() {
        let harness = Harness::new();
        harness.window.append(event(1)).unwrap();

        let layer = CountingLayer::new(2);
        let (_, join) = harness.spawn(layer.clone(), ValidationErrorPolicy::HaltAndAlert);

        {
            let layer = layer.clone();
            assert!(wait_until(move || layer.applied() == vec![1], Duration::from_secs(2)).await);
        }

        harness.shutdown_tx.send(()).unwrap();
        join.await.unwrap();
        assert!(harness.metrics.snapshot().retries >= 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_loop() {
        let harness = Harness::new();
        harness.window.append(event(1)).unwrap();

        // More failures than max_retries
        let layer = CountingLayer::new(10);
        let (state, join) = harness.spawn(layer, ValidationErrorPolicy::HaltAndAlert);
        join.await.unwrap();

        assert_eq!(*state.read().await, DispatchState::Failed);
        assert_eq!(harness.dispatch_checkpoint().await, None);
    }

    #[tokio::test]
    async fn test_underflow_fails_loop() {
        let harness = Harness::new();
        // Window resumed past scn 5: history 1..=5 is gone
        let window = Arc::new(EventWindow::resuming_from(partition(), 64, 64, 5));
        let dispatch = DispatchLoop::new(
            partition(),
            "dest",
            window,
            harness.tracker.clone(),
            CountingLayer::new(0),
            fast_settings(ValidationErrorPolicy::HaltAndAlert),
            harness.dead_letters.clone(),
            harness.metrics.clone(),
        );
        let state = dispatch.state_handle();
        dispatch.run(harness.shutdown_tx.subscribe()).await;

        assert_eq!(*state.read().await, DispatchState::Failed);
    }

    #[test]
    fn test_dead_letter_queue_bounds() {
        let dlq = DeadLetterQueue::new(2);
        for scn in 1..=3 {
            dlq.record(DeadLetterRecord {
                event: event(scn),
                destination: "dest".into(),
                reason: "bad".into(),
                recorded_at: 0,
            });
        }
        assert_eq!(dlq.len(), 2);
        assert_eq!(dlq.total_recorded(), 3);

        let records = dlq.drain();
        assert_eq!(records[0].event.scn, 2);
        assert!(dlq.is_empty());
        assert_eq!(dlq.total_recorded(), 3);
    }
}
