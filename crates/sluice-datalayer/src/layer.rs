//! Destination data-layer contract
//!
//! A data layer applies one change event at a time, idempotently, keyed by
//! primary key and operation. Instances are shared: the relay constructs one
//! per destination type at startup and every dispatch loop of that type holds
//! the same `Arc`, so implementations must tolerate concurrent `apply` calls.

use crate::error::{DataLayerError, Result};
use async_trait::async_trait;
use sluice_core::{ChangeEvent, Scn};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Acknowledgement of one applied change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// The applied event's scn
    pub scn: Scn,
}

impl Ack {
    /// Acknowledge the event at `scn`.
    pub fn at(scn: Scn) -> Self {
        Self { scn }
    }
}

/// Trait for destination data layers.
///
/// `apply` must be idempotent: applying the same event twice (same scn, same
/// key, same operation) produces the same end state with no duplicate side
/// effect — dispatch loops may redeliver after a crash before the checkpoint
/// advances. UPSERT overwrites the record at `event.key`; DELETE removes it;
/// a DELETE for a missing key is a successful no-op.
#[async_trait]
pub trait DataLayer: Send + Sync {
    /// Destination type tag this layer serves (e.g. "hbase-delete").
    fn destination(&self) -> &str;

    /// Apply one change event.
    async fn apply(&self, event: &ChangeEvent) -> Result<Ack>;
}

/// Trait for data-layer factories.
///
/// A factory owns the dependencies its layer needs (named connection
/// handles) — the relay core never constructs connections. The
/// [`DestinationRegistry`] calls `create` exactly once per destination type,
/// so every dispatch loop shares a single live instance.
pub trait DataLayerFactory: Send + Sync {
    /// Destination type tag the created layer serves.
    fn destination(&self) -> &str;

    /// Create the data layer.
    fn create(&self) -> Result<Arc<dyn DataLayer>>;
}

/// Registry of live data-layer instances, one per destination type.
///
/// Built once at relay startup from the configured factories; duplicate
/// destination tags are a configuration error.
pub struct DestinationRegistry {
    layers: HashMap<String, Arc<dyn DataLayer>>,
}

impl DestinationRegistry {
    /// Build the registry, instantiating each factory exactly once.
    pub fn build(factories: &[Arc<dyn DataLayerFactory>]) -> Result<Self> {
        let mut layers: HashMap<String, Arc<dyn DataLayer>> = HashMap::new();
        for factory in factories {
            let tag = factory.destination().to_string();
            if layers.contains_key(&tag) {
                return Err(DataLayerError::fatal(format!(
                    "duplicate data-layer factory for destination '{}'",
                    tag
                )));
            }
            let layer = factory.create()?;
            info!("Registered data layer '{}'", tag);
            layers.insert(tag, layer);
        }
        Ok(Self { layers })
    }

    /// Get the shared layer for a destination type.
    pub fn get(&self, destination: &str) -> Option<Arc<dyn DataLayer>> {
        self.layers.get(destination).cloned()
    }

    /// Registered destination type tags.
    pub fn destinations(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.layers.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Number of registered destinations.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no destinations are registered.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
