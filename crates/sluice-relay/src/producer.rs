//! Per-partition event producer
//!
//! Pulls raw changes from one source, assigns monotonic sequence numbers,
//! and appends them to the partition's window. Append and capture-checkpoint
//! update form one logical step: if the checkpoint write fails, the appended
//! event is rolled back so tracker and window never diverge.
//!
//! State machine:
//!
//! ```text
//! Stopped → Starting → Running ⇄ Paused
//!                         │  └──────────► Stopping → Stopped
//!                         └── (failures exhausted) ──► Errored
//! ```
//!
//! Transient source failures retry with backoff; a bounded number of
//! consecutive failures moves the producer to `Errored` and raises an
//! operator-visible alert instead of retrying forever. A sequence gap
//! restarts the stream from the last capture checkpoint.

use crate::source::{ChangeSource, SourceChange, SourcePosition};
use sluice_core::{
    BootstrapPolicy, ChangeEvent, CheckpointRole, Error as CoreError, EventOp, EventWindow,
    PhysicalPartition, ProducerSettings, RelayMetrics, SequenceTracker,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Producer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    /// Not yet started, or stopped cleanly
    Stopped,
    /// Reading the checkpoint and opening the source
    Starting,
    /// Capturing changes
    Running,
    /// Paused by operator command
    Paused,
    /// Draining on shutdown
    Stopping,
    /// Failed after exhausting retries; requires operator attention
    Errored,
}

impl fmt::Display for ProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopping => write!(f, "stopping"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

enum OpenOutcome {
    Opened,
    Shutdown,
    Failed,
}

enum CaptureOutcome {
    Captured,
    Gap { got: u64 },
    Shutdown,
    Failed,
}

/// Per-partition capture worker.
pub struct EventProducer {
    partition: PhysicalPartition,
    bootstrap: BootstrapPolicy,
    settings: ProducerSettings,
    source: Box<dyn ChangeSource>,
    window: Arc<EventWindow>,
    tracker: Arc<SequenceTracker>,
    metrics: Arc<RelayMetrics>,
    state: Arc<RwLock<ProducerState>>,
}

impl EventProducer {
    /// Create a producer for one partition.
    pub fn new(
        partition: PhysicalPartition,
        source: Box<dyn ChangeSource>,
        window: Arc<EventWindow>,
        tracker: Arc<SequenceTracker>,
        bootstrap: BootstrapPolicy,
        settings: ProducerSettings,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            partition,
            bootstrap,
            settings,
            source,
            window,
            tracker,
            metrics,
            state: Arc::new(RwLock::new(ProducerState::Stopped)),
        }
    }

    /// Shared state handle for health checks; grab before calling `run`.
    pub fn state_handle(&self) -> Arc<RwLock<ProducerState>> {
        self.state.clone()
    }

    /// The partition this producer captures.
    pub fn partition(&self) -> &PhysicalPartition {
        &self.partition
    }

    async fn set_state(&self, state: ProducerState) {
        *self.state.write().await = state;
        debug!("Producer '{}' -> {}", self.partition, state);
    }

    /// Run the capture loop until shutdown, pause-aware.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
        mut pause: watch::Receiver<bool>,
    ) {
        self.set_state(ProducerState::Starting).await;

        let checkpoint = match self
            .tracker
            .get(&self.partition, &CheckpointRole::Capture)
            .await
        {
            Ok(cp) => cp,
            Err(e) => {
                error!(
                    "Producer '{}': cannot read capture checkpoint: {} (alert)",
                    self.partition, e
                );
                self.set_state(ProducerState::Errored).await;
                return;
            }
        };

        let position = match checkpoint {
            Some(scn) => SourcePosition::After(scn),
            None => match self.bootstrap {
                BootstrapPolicy::Earliest => SourcePosition::Earliest,
                BootstrapPolicy::Latest => SourcePosition::Latest,
            },
        };
        info!(
            "Producer '{}' starting at {} (checkpoint: {:?})",
            self.partition, position, checkpoint
        );

        match self.open_with_retry(position, &mut shutdown).await {
            OpenOutcome::Opened => {}
            OpenOutcome::Shutdown => {
                self.stop().await;
                return;
            }
            OpenOutcome::Failed => {
                self.fail().await;
                return;
            }
        }

        self.set_state(ProducerState::Running).await;
        let retry = self.settings.retry.to_retry_config();
        let idle = Duration::from_millis(self.settings.idle_wait_ms);
        let mut consecutive_failures = 0u32;

        'capture: loop {
            // Pause is observed between polls
            if *pause.borrow() {
                self.set_state(ProducerState::Paused).await;
                info!("Producer '{}' paused", self.partition);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break 'capture,
                        changed = pause.changed() => {
                            if changed.is_err() || !*pause.borrow() {
                                break;
                            }
                        }
                    }
                }
                self.set_state(ProducerState::Running).await;
                info!("Producer '{}' resumed", self.partition);
            }

            let polled = tokio::select! {
                biased;
                _ = shutdown.recv() => break 'capture,
                polled = self.source.poll() => polled,
            };

            match polled {
                Ok(batch) if batch.is_empty() => {
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break 'capture,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                Ok(batch) => {
                    consecutive_failures = 0;
                    for change in batch {
                        match self.capture(change, &mut shutdown).await {
                            CaptureOutcome::Captured => {}
                            CaptureOutcome::Shutdown => break 'capture,
                            CaptureOutcome::Gap { got } => {
                                let resume = self.window.last_scn();
                                warn!(
                                    "Producer '{}': sequence gap (got scn {}), restarting after {}",
                                    self.partition, got, resume
                                );
                                match self
                                    .open_with_retry(SourcePosition::After(resume), &mut shutdown)
                                    .await
                                {
                                    OpenOutcome::Opened => break, // drop the rest, re-poll
                                    OpenOutcome::Shutdown => break 'capture,
                                    OpenOutcome::Failed => {
                                        self.fail().await;
                                        return;
                                    }
                                }
                            }
                            CaptureOutcome::Failed => {
                                self.fail().await;
                                return;
                            }
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    self.metrics.record_capture_error();
                    consecutive_failures += 1;
                    if consecutive_failures >= self.settings.max_consecutive_failures {
                        error!(
                            "Producer '{}': {} consecutive source failures, last: {} (alert)",
                            self.partition, consecutive_failures, e
                        );
                        self.fail().await;
                        return;
                    }
                    let delay = retry.delay_for_attempt(consecutive_failures - 1);
                    self.metrics.record_retry();
                    warn!(
                        "Producer '{}': transient source failure ({}), retry {}/{} in {:?}",
                        self.partition,
                        e,
                        consecutive_failures,
                        self.settings.max_consecutive_failures,
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break 'capture,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.metrics.record_capture_error();
                    error!(
                        "Producer '{}': fatal source failure: {} (alert)",
                        self.partition, e
                    );
                    self.fail().await;
                    return;
                }
            }
        }

        self.stop().await;
    }

    /// Append one change and advance the capture checkpoint as one logical
    /// step, rolling the append back when the checkpoint write fails.
    async fn capture(
        &mut self,
        change: SourceChange,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> CaptureOutcome {
        let expected = self.window.last_scn() + 1;
        let scn = change.scn.unwrap_or(expected);
        if scn != expected {
            // A native sequence is honored only while it continues ours
            return CaptureOutcome::Gap { got: scn };
        }

        let event = match change.op {
            EventOp::Upsert => ChangeEvent::upsert(
                self.partition.clone(),
                scn,
                change.entity,
                change.key,
                change.payload,
            ),
            EventOp::Delete => {
                ChangeEvent::delete(self.partition.clone(), scn, change.entity, change.key)
            }
        };

        let retry = self.settings.retry.to_retry_config();
        let mut attempt = 0u32;
        loop {
            match self.window.append(event.clone()) {
                Ok(()) => {}
                Err(CoreError::SequenceGap { got, .. }) => {
                    return CaptureOutcome::Gap { got };
                }
                Err(e) => {
                    error!(
                        "Producer '{}': append failed at scn {}: {} (alert)",
                        self.partition, scn, e
                    );
                    return CaptureOutcome::Failed;
                }
            }

            match self
                .tracker
                .set(&self.partition, &CheckpointRole::Capture, scn)
                .await
            {
                Ok(()) => {
                    self.metrics.record_captured();
                    return CaptureOutcome::Captured;
                }
                Err(e) => {
                    // Keep tracker and window in lockstep before anything else
                    self.window.rollback_last(scn);
                    self.metrics.record_capture_error();
                    if e.is_retriable() && retry.should_retry(attempt) {
                        let delay = retry.delay_for_attempt(attempt);
                        attempt += 1;
                        self.metrics.record_retry();
                        warn!(
                            "Producer '{}': capture checkpoint failed at scn {} ({}), retrying in {:?}",
                            self.partition, scn, e, delay
                        );
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => return CaptureOutcome::Shutdown,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        error!(
                            "Producer '{}': capture checkpoint failed at scn {}: {} (alert)",
                            self.partition, scn, e
                        );
                        return CaptureOutcome::Failed;
                    }
                }
            }
        }
    }

    async fn open_with_retry(
        &mut self,
        position: SourcePosition,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> OpenOutcome {
        let retry = self.settings.retry.to_retry_config();
        let mut attempt = 0u32;
        loop {
            let opened = tokio::select! {
                biased;
                _ = shutdown.recv() => return OpenOutcome::Shutdown,
                opened = self.source.open(position) => opened,
            };
            match opened {
                Ok(()) => return OpenOutcome::Opened,
                Err(e) if e.is_retryable() && retry.should_retry(attempt) => {
                    self.metrics.record_capture_error();
                    let delay = retry.delay_for_attempt(attempt);
                    attempt += 1;
                    self.metrics.record_retry();
                    warn!(
                        "Producer '{}': source open failed ({}), retrying in {:?}",
                        self.partition, e, delay
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => return OpenOutcome::Shutdown,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.metrics.record_capture_error();
                    error!(
                        "Producer '{}': source open failed: {} (alert)",
                        self.partition, e
                    );
                    return OpenOutcome::Failed;
                }
            }
        }
    }

    async fn stop(&mut self) {
        self.set_state(ProducerState::Stopping).await;
        if let Err(e) = self.source.close().await {
            warn!("Producer '{}': source close failed: {}", self.partition, e);
        }
        self.set_state(ProducerState::Stopped).await;
        info!("Producer '{}' stopped", self.partition);
    }

    async fn fail(&mut self) {
        if let Err(e) = self.source.close().await {
            warn!("Producer '{}': source close failed: {}", self.partition, e);
        }
        self.set_state(ProducerState::Errored).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ScriptedSource;
    use serde_json::json;
    use sluice_core::RetrySettings;

    fn partition() -> PhysicalPartition {
        PhysicalPartition::new("orders", 0)
    }

    fn fast_settings() -> ProducerSettings {
        ProducerSettings {
            idle_wait_ms: 5,
            max_consecutive_failures: 3,
            retry: RetrySettings {
                max_retries: 3,
                retry_delay_ms: 1,
                max_delay_ms: 5,
                jitter: 0.0,
            },
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

    struct Harness {
        window: Arc<EventWindow>,
        tracker: Arc<SequenceTracker>,
        metrics: Arc<RelayMetrics>,
        shutdown_tx: broadcast::Sender<()>,
        pause_tx: watch::Sender<bool>,
        // Keep the initial watch receiver alive so `pause_tx.send` works before
        // any producer has subscribed (a watch sender errors with zero receivers).
        _pause_rx: watch::Receiver<bool>,
    }

    impl Harness {
        fn new(resume_from: u64) -> Self {
            let (shutdown_tx, _) = broadcast::channel(4);
            let (pause_tx, pause_rx) = watch::channel(false);
            Self {
                window: Arc::new(EventWindow::resuming_from(partition(), 64, 64, resume_from)),
                tracker: Arc::new(SequenceTracker::in_memory()),
                metrics: Arc::new(RelayMetrics::new()),
                shutdown_tx,
                pause_tx,
                _pause_rx: pause_rx,
            }
        }

        fn spawn(&self, source: ScriptedSource) -> (Arc<RwLock<ProducerState>>, tokio::task::JoinHandle<()>) {
            let producer = EventProducer::new(
                partition(),
                Box::new(source),
                self.window.clone(),
                self.tracker.clone(),
                BootstrapPolicy::Earliest,
                fast_settings(),
                self.metrics.clone(),
            );
            let state = producer.state_handle();
            let shutdown = self.shutdown_tx.subscribe();
            let pause = self.pause_tx.subscribe();
            let join = tokio::spawn(producer.run(shutdown, pause));
            (state, join)
        }
    }

    #[tokio::test]
    async fn test_captures_and_checkpoints() {
        let harness = Harness::new(0);
        let source = ScriptedSource::new("orders:0").push_changes(vec![
            SourceChange::upsert("orders", "o-1", json!({"total": 1})),
            SourceChange::upsert("orders", "o-2", json!({"total": 2})),
            SourceChange::delete("orders", "o-1"),
        ]);

        let (state, join) = harness.spawn(source);

        let window = harness.window.clone();
        assert!(wait_until(|| window.last_scn() == 3, Duration::from_secs(2)).await);

        harness.shutdown_tx.send(()).unwrap();
        join.await.unwrap();

        assert_eq!(*state.read().await, ProducerState::Stopped);
        assert_eq!(
            harness
                .tracker
                .get(&partition(), &CheckpointRole::Capture)
                .await
                .unwrap(),
            Some(3)
        );

        let events = harness.window.read_from(1, 10).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].op, EventOp::Delete);
        assert_eq!(harness.metrics.snapshot().events_captured, 3);
    }

    #[tokio::test]
    async fn test_resumes_after_checkpoint() {
        let harness = Harness::new(2);
        harness
            .tracker
            .set(&partition(), &CheckpointRole::Capture, 2)
            .await
            .unwrap();

        let source = ScriptedSource::new("orders:0")
            .push_changes(vec![SourceChange::upsert("orders", "o-3", json!({}))]);

        let (_, join) = harness.spawn(source);

        let window = harness.window.clone();
        assert!(wait_until(|| window.last_scn() == 3, Duration::from_secs(2)).await);

        harness.shutdown_tx.send(()).unwrap();
        join.await.unwrap();

        // Resumed exactly after the checkpoint
        let events = harness.window.read_from(3, 10).unwrap();
        assert_eq!(events[0].scn, 3);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let harness = Harness::new(0);
        let source = ScriptedSource::new("orders:0")
            .push_failure("connection reset")
            .push_failure("connection reset")
            .push_changes(vec![SourceChange::upsert("orders", "o-1", json!({}))]);

        let (state, join) = harness.spawn(source);

        let window = harness.window.clone();
        assert!(wait_until(|| window.last_scn() == 1, Duration::from_secs(2)).await);
        assert_eq!(*state.read().await, ProducerState::Running);

        harness.shutdown_tx.send(()).unwrap();
        join.await.unwrap();
        assert!(harness.metrics.snapshot().retries >= 2);
    }

    #[tokio::test]
    async fn test_exhausted_failures_move_to_errored() {
        let harness = Harness::new(0);
        let mut source = ScriptedSource::new("orders:0");
        for _ in 0..4 {
            source = source.push_failure("connection reset");
        }

        let (state, join) = harness.spawn(source);
        join.await.unwrap();

        assert_eq!(*state.read().await, ProducerState::Errored);
        assert!(harness.metrics.snapshot().capture_errors >= 3);
    }

    #[tokio::test]
    async fn test_native_gap_restarts_from_checkpoint() {
        let harness = Harness::new(0);
        let source = ScriptedSource::new("orders:0")
            // Native scn 5 does not continue the empty sequence
            .push_changes(vec![
                SourceChange::upsert("orders", "o-x", json!({})).with_scn(5)
            ])
            // After the restart the source serves a contiguous change
            .push_changes(vec![
                SourceChange::upsert("orders", "o-1", json!({})).with_scn(1)
            ]);

        let (_, join) = harness.spawn(source);

        let window = harness.window.clone();
        assert!(wait_until(|| window.last_scn() == 1, Duration::from_secs(2)).await);

        harness.shutdown_tx.send(()).unwrap();
        join.await.unwrap();

        let events = harness.window.read_from(1, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "o-1");
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let harness = Harness::new(0);
        harness.pause_tx.send(true).unwrap();

        let source = ScriptedSource::new("orders:0")
            .push_changes(vec![SourceChange::upsert("orders", "o-1", json!({}))]);
        let (state, join) = harness.spawn(source);

        {
            let state = state.clone();
            assert!(
                wait_until(
                    move || matches!(
                        state.try_read().map(|s| *s),
                        Ok(ProducerState::Paused)
                    ),
                    Duration::from_secs(2)
                )
                .await
            );
        }
        assert_eq!(harness.window.last_scn(), 0);

        harness.pause_tx.send(false).unwrap();
        let window = harness.window.clone();
        assert!(wait_until(|| window.last_scn() == 1, Duration::from_secs(2)).await);

        harness.shutdown_tx.send(()).unwrap();
        join.await.unwrap();
    }
}
