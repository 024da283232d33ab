//! Relay coordinator
//!
//! Top-level composition: owns the sequence tracker, per-partition windows,
//! the producer registry, the destination registry, and one dispatch loop
//! per (partition × destination). Built by an explicit
//! [`Relay::initialize`] call — no container lifecycle hooks, no global
//! state — so several relays can coexist in one process.

use crate::dispatch::{DeadLetterQueue, DispatchLoop, DispatchState};
use crate::error::{RelayError, Result};
use crate::producer::{EventProducer, ProducerState};
use crate::registry::ProducerRegistry;
use crate::source::ChangeSource;
use futures::stream::BoxStream;
use futures::StreamExt;
use sluice_core::{
    ChangeEvent, CheckpointRole, EventWindow, FileCheckpointStore, MemoryCheckpointStore,
    PhysicalPartition, RelayConfig, RelayMetrics, Scn, SequenceTracker, SharedCheckpointBackend,
};
use sluice_datalayer::{DataLayerFactory, DestinationRegistry};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How often acknowledged window entries are reclaimed.
const RETENTION_INTERVAL: Duration = Duration::from_millis(200);

/// Retained dead-letter records per relay.
const DEAD_LETTER_CAPACITY: usize = 1024;

/// Relay lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Initialized, not yet started
    Created,
    /// Producers and dispatch loops running
    Running,
    /// Draining on shutdown
    ShuttingDown,
    /// Stopped
    Stopped,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

struct DispatchHandle {
    partition: PhysicalPartition,
    destination: String,
    state: Arc<RwLock<DispatchState>>,
    join: Option<JoinHandle<()>>,
}

/// Change-data-capture relay.
pub struct Relay {
    config: RelayConfig,
    tracker: Arc<SequenceTracker>,
    windows: HashMap<PhysicalPartition, Arc<EventWindow>>,
    destinations: DestinationRegistry,
    registry: ProducerRegistry,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<RelayMetrics>,
    state: RwLock<RelayState>,
    shutdown_tx: broadcast::Sender<()>,
    sources: Mutex<Option<HashMap<PhysicalPartition, Box<dyn ChangeSource>>>>,
    dispatch_handles: Mutex<Vec<DispatchHandle>>,
    retention_join: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    /// Build a relay from configuration, one opened source per partition,
    /// and the data-layer factories for the configured destinations.
    ///
    /// Reads capture checkpoints to size each partition's resume point; the
    /// relay never constructs connections itself.
    pub async fn initialize(
        config: RelayConfig,
        mut sources: HashMap<PhysicalPartition, Box<dyn ChangeSource>>,
        factories: &[Arc<dyn DataLayerFactory>],
    ) -> Result<Relay> {
        config.validate()?;

        let backend: SharedCheckpointBackend = match &config.checkpoint.dir {
            Some(dir) => Arc::new(
                FileCheckpointStore::with_options(dir, config.checkpoint.fsync).await?,
            ),
            None => Arc::new(MemoryCheckpointStore::new()),
        };
        let tracker = Arc::new(SequenceTracker::new(backend));

        let destinations = DestinationRegistry::build(factories)?;
        for dest in &config.destinations {
            if destinations.get(dest).is_none() {
                return Err(RelayError::config(format!(
                    "no data-layer factory for destination '{}'",
                    dest
                )));
            }
        }

        let mut windows = HashMap::new();
        let mut kept_sources = HashMap::new();
        for settings in &config.partitions {
            let partition = settings.partition();
            let source = sources.remove(&partition).ok_or_else(|| {
                RelayError::config(format!("no source for partition {}", partition))
            })?;
            kept_sources.insert(partition.clone(), source);

            let checkpoint = tracker
                .get(&partition, &CheckpointRole::Capture)
                .await?
                .unwrap_or(0);
            windows.insert(
                partition.clone(),
                Arc::new(EventWindow::resuming_from(
                    partition,
                    config.window.capacity,
                    config.window.max_retained,
                    checkpoint,
                )),
            );
        }
        for partition in sources.keys() {
            warn!("Ignoring source for unconfigured partition {}", partition);
        }

        let (shutdown_tx, _) = broadcast::channel(16);
        let registry = ProducerRegistry::new(shutdown_tx.clone());

        info!(
            "Relay initialized: {} partitions, destinations: {:?}",
            config.partitions.len(),
            config.destinations
        );

        Ok(Relay {
            config,
            tracker,
            windows,
            destinations,
            registry,
            dead_letters: Arc::new(DeadLetterQueue::new(DEAD_LETTER_CAPACITY)),
            metrics: Arc::new(RelayMetrics::new()),
            state: RwLock::new(RelayState::Created),
            shutdown_tx,
            sources: Mutex::new(Some(kept_sources)),
            dispatch_handles: Mutex::new(Vec::new()),
            retention_join: Mutex::new(None),
        })
    }

    /// Start producers, dispatch loops, and the retention task.
    ///
    /// Idempotent: calling `start` again without an intervening shutdown is
    /// a no-op returning the current state.
    pub async fn start(&self) -> Result<RelayState> {
        {
            let mut state = self.state.write().await;
            if *state != RelayState::Created {
                info!("Relay start requested while {}; no-op", state);
                return Ok(*state);
            }
            *state = RelayState::Running;
        }

        let mut sources = self
            .sources
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayError::Other("relay sources already consumed".into()))?;

        let mut dispatch_handles = self.dispatch_handles.lock().await;
        for settings in &self.config.partitions {
            let partition = settings.partition();
            let source = sources.remove(&partition).ok_or_else(|| {
                RelayError::config(format!("no source for partition {}", partition))
            })?;
            let window = self
                .windows
                .get(&partition)
                .cloned()
                .expect("window exists for every configured partition");

            let producer = EventProducer::new(
                partition.clone(),
                source,
                window.clone(),
                self.tracker.clone(),
                settings.bootstrap,
                self.config.producer.clone(),
                self.metrics.clone(),
            );
            self.registry.spawn(producer).await?;

            for dest in &self.config.destinations {
                let layer = self
                    .destinations
                    .get(dest)
                    .expect("destination validated at initialize");
                let dispatch = DispatchLoop::new(
                    partition.clone(),
                    dest.clone(),
                    window.clone(),
                    self.tracker.clone(),
                    layer,
                    self.config.dispatch.clone(),
                    self.dead_letters.clone(),
                    self.metrics.clone(),
                );
                let state = dispatch.state_handle();
                let join = tokio::spawn(dispatch.run(self.shutdown_tx.subscribe()));
                dispatch_handles.push(DispatchHandle {
                    partition: partition.clone(),
                    destination: dest.clone(),
                    state,
                    join: Some(join),
                });
            }
        }
        drop(dispatch_handles);

        self.spawn_retention_task().await;

        info!(
            "Relay started: {} producers, {} dispatch loops",
            self.config.partitions.len(),
            self.config.partitions.len() * self.config.destinations.len()
        );
        Ok(RelayState::Running)
    }

    async fn spawn_retention_task(&self) {
        let windows: Vec<(PhysicalPartition, Arc<EventWindow>)> = self
            .windows
            .iter()
            .map(|(p, w)| (p.clone(), w.clone()))
            .collect();
        let tracker = self.tracker.clone();
        let destinations = self.config.destinations.clone();
        let metrics = self.metrics.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        let join = tokio::spawn(async move {
            if destinations.is_empty() {
                // Nothing acknowledges events; the hard retention cap is the
                // only reclaim path.
                return;
            }
            let mut tick = tokio::time::interval(RETENTION_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = tick.tick() => {
                        for (partition, window) in &windows {
                            match tracker.min_dispatch(partition, &destinations).await {
                                Ok(min) if min > 0 => {
                                    let evicted = window.evict_acknowledged(min);
                                    if evicted > 0 {
                                        metrics.record_evicted(evicted as u64);
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => warn!(
                                    "Retention: cannot read dispatch checkpoints for {}: {}",
                                    partition, e
                                ),
                            }
                        }
                    }
                }
            }
        });
        *self.retention_join.lock().await = Some(join);
    }

    /// Pause one partition's producer, or all producers.
    pub async fn pause(&self, partition: Option<&PhysicalPartition>) -> Result<()> {
        self.registry.pause(partition).await
    }

    /// Resume one partition's producer, or all producers.
    pub async fn resume(&self, partition: Option<&PhysicalPartition>) -> Result<()> {
        self.registry.resume(partition).await
    }

    /// Shut down with a graceful drain up to `timeout`, then force-stop.
    ///
    /// Idempotent. In-flight applies finish before their loop observes the
    /// signal; work abandoned after the deadline was not checkpointed and is
    /// re-delivered after restart.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                RelayState::Stopped | RelayState::ShuttingDown => return Ok(()),
                RelayState::Created => {
                    *state = RelayState::Stopped;
                    return Ok(());
                }
                RelayState::Running => *state = RelayState::ShuttingDown,
            }
        }
        info!("Relay shutting down (drain timeout {:?})", timeout);

        // Receivers observe this at their next suspension point
        let _ = self.shutdown_tx.send(());
        let deadline = tokio::time::Instant::now() + timeout;

        {
            let mut handles = self.dispatch_handles.lock().await;
            for handle in handles.iter_mut() {
                if let Some(task) = handle.join.take() {
                    let remaining =
                        deadline.saturating_duration_since(tokio::time::Instant::now());
                    match tokio::time::timeout(remaining, task).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(
                            "Dispatch task {} -> {} panicked: {}",
                            handle.partition, handle.destination, e
                        ),
                        Err(_) => warn!(
                            "Dispatch {} -> {} did not drain in time, aborting",
                            handle.partition, handle.destination
                        ),
                    }
                }
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        self.registry.join_all(remaining).await;

        if let Some(task) = self.retention_join.lock().await.take() {
            task.abort();
        }

        *self.state.write().await = RelayState::Stopped;
        info!("Relay stopped");
        Ok(())
    }

    /// Streaming read protocol: ordered events from `from` onward.
    ///
    /// Same ordering and underflow semantics as the window's `read_from`:
    /// a request below retained history fails immediately; a subscriber that
    /// later falls behind the hard retention cap receives the underflow
    /// error as the stream's final item. The stream ends at relay shutdown.
    pub async fn subscribe(
        &self,
        partition: &PhysicalPartition,
        from: Scn,
    ) -> Result<BoxStream<'static, Result<ChangeEvent>>> {
        let window = self
            .windows
            .get(partition)
            .cloned()
            .ok_or_else(|| RelayError::config(format!("unknown partition: {}", partition)))?;

        let from = from.max(1);
        let evicted = window.evicted_through();
        if from <= evicted {
            return Err(sluice_core::Error::WindowUnderflow {
                partition: partition.clone(),
                requested: from,
                oldest_retained: evicted + 1,
            }
            .into());
        }

        struct SubscribeState {
            window: Arc<EventWindow>,
            next: Scn,
            buffer: VecDeque<ChangeEvent>,
            shutdown: broadcast::Receiver<()>,
            batch: usize,
            wait: Duration,
            failed: bool,
        }

        let state = SubscribeState {
            window,
            next: from,
            buffer: VecDeque::new(),
            shutdown: self.shutdown_tx.subscribe(),
            batch: self.config.dispatch.batch_size,
            wait: self.config.dispatch.wait(),
            failed: false,
        };

        let stream = futures::stream::unfold(state, |mut s| async move {
            if s.failed {
                return None;
            }
            loop {
                if let Some(event) = s.buffer.pop_front() {
                    s.next = event.scn + 1;
                    return Some((Ok(event), s));
                }
                match s.window.read_from(s.next, s.batch) {
                    Ok(batch) if batch.is_empty() => {
                        tokio::select! {
                            biased;
                            _ = s.shutdown.recv() => return None,
                            _ = s.window.wait_for(s.next, s.wait) => {}
                        }
                    }
                    Ok(batch) => s.buffer.extend(batch),
                    Err(e) => {
                        // Surface the underflow, then end the stream
                        s.failed = true;
                        return Some((Err(e.into()), s));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    /// Current relay state.
    pub async fn state(&self) -> RelayState {
        *self.state.read().await
    }

    /// Shared metrics collector.
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.metrics.clone()
    }

    /// Dead-letter queue for inspection and draining.
    pub fn dead_letters(&self) -> Arc<DeadLetterQueue> {
        self.dead_letters.clone()
    }

    /// Producer state per partition.
    pub async fn producer_states(&self) -> HashMap<PhysicalPartition, ProducerState> {
        self.registry.states().await
    }

    /// Dispatch loop state per (partition, destination).
    pub async fn dispatch_states(&self) -> HashMap<(PhysicalPartition, String), DispatchState> {
        let handles = self.dispatch_handles.lock().await;
        let mut states = HashMap::new();
        for handle in handles.iter() {
            states.insert(
                (handle.partition.clone(), handle.destination.clone()),
                *handle.state.read().await,
            );
        }
        states
    }
}
