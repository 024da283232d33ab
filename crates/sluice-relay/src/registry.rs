//! Producer registry
//!
//! Owns the set of active event producers keyed by physical partition and
//! propagates lifecycle commands to them. One registry per relay instance —
//! there is no process-wide registry, so multiple relays coexist in one
//! process (and in one test binary).

use crate::error::{RelayError, Result};
use crate::producer::{EventProducer, ProducerState};
use sluice_core::PhysicalPartition;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle to one spawned producer.
pub struct ProducerHandle {
    partition: PhysicalPartition,
    state: Arc<RwLock<ProducerState>>,
    pause_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ProducerHandle {
    /// Current producer state.
    pub async fn state(&self) -> ProducerState {
        *self.state.read().await
    }

    /// The producer's partition.
    pub fn partition(&self) -> &PhysicalPartition {
        &self.partition
    }
}

/// Registry of active producers for one relay instance.
pub struct ProducerRegistry {
    producers: RwLock<HashMap<PhysicalPartition, Arc<ProducerHandle>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProducerRegistry {
    /// Create a registry wired to the relay's shutdown channel.
    pub fn new(shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            producers: RwLock::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Spawn a producer and register its handle.
    pub async fn spawn(&self, producer: EventProducer) -> Result<()> {
        let partition = producer.partition().clone();

        let mut producers = self.producers.write().await;
        if producers.contains_key(&partition) {
            return Err(RelayError::config(format!(
                "producer already registered for {}",
                partition
            )));
        }

        let state = producer.state_handle();
        let (pause_tx, pause_rx) = watch::channel(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let join = tokio::spawn(producer.run(shutdown_rx, pause_rx));

        producers.insert(
            partition.clone(),
            Arc::new(ProducerHandle {
                partition: partition.clone(),
                state,
                pause_tx,
                join: Mutex::new(Some(join)),
            }),
        );
        info!("Registered producer for {}", partition);
        Ok(())
    }

    /// Pause one partition's producer, or all when `partition` is None.
    pub async fn pause(&self, partition: Option<&PhysicalPartition>) -> Result<()> {
        self.set_paused(partition, true).await
    }

    /// Resume one partition's producer, or all when `partition` is None.
    pub async fn resume(&self, partition: Option<&PhysicalPartition>) -> Result<()> {
        self.set_paused(partition, false).await
    }

    async fn set_paused(&self, partition: Option<&PhysicalPartition>, paused: bool) -> Result<()> {
        let producers = self.producers.read().await;
        match partition {
            Some(partition) => {
                let handle = producers.get(partition).ok_or_else(|| {
                    RelayError::config(format!("unknown partition: {}", partition))
                })?;
                // Send only fails when the producer task is gone; pausing a
                // finished producer is a no-op, not an error.
                let _ = handle.pause_tx.send(paused);
            }
            None => {
                for handle in producers.values() {
                    let _ = handle.pause_tx.send(paused);
                }
            }
        }
        Ok(())
    }

    /// Current state per partition.
    pub async fn states(&self) -> HashMap<PhysicalPartition, ProducerState> {
        let producers = self.producers.read().await;
        let mut states = HashMap::new();
        for (partition, handle) in producers.iter() {
            states.insert(partition.clone(), handle.state().await);
        }
        states
    }

    /// Registered partitions.
    pub async fn partitions(&self) -> Vec<PhysicalPartition> {
        let mut partitions: Vec<_> = self.producers.read().await.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Join all producers after a shutdown broadcast, aborting any that are
    /// still running when the drain timeout expires.
    ///
    /// The caller sends the shutdown signal; this only waits.
    pub async fn join_all(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        let producers = self.producers.read().await;
        for handle in producers.values() {
            let mut join = handle.join.lock().await;
            if let Some(task) = join.take() {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                match tokio::time::timeout(remaining, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Producer task for {} panicked: {}", handle.partition, e);
                    }
                    Err(_) => {
                        warn!(
                            "Producer for {} did not drain within {:?}, aborting",
                            handle.partition, timeout
                        );
                        // Abandoned work was not checkpointed and will be
                        // re-captured after restart.
                    }
                }
            }
        }
    }
}
