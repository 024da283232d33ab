//! In-memory data layer
//!
//! Keyed table store (`entity -> key -> payload`), idempotent by
//! construction. Reference destination and test double.

use crate::error::{DataLayerError, Result};
use crate::layer::{Ack, DataLayer, DataLayerFactory};
use async_trait::async_trait;
use parking_lot::RwLock;
use sluice_core::{ChangeEvent, EventOp};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// In-process keyed table store.
pub struct MemoryDataLayer {
    destination: String,
    tables: RwLock<HashMap<String, HashMap<String, serde_json::Value>>>,
}

impl MemoryDataLayer {
    /// Create a layer serving the given destination tag.
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Current payload for `key` in `entity`, if present.
    pub fn get(&self, entity: &str, key: &str) -> Option<serde_json::Value> {
        self.tables.read().get(entity)?.get(key).cloned()
    }

    /// Number of records stored for `entity`.
    pub fn row_count(&self, entity: &str) -> usize {
        self.tables.read().get(entity).map_or(0, |t| t.len())
    }
}

#[async_trait]
impl DataLayer for MemoryDataLayer {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<Ack> {
        if event.key.is_empty() {
            return Err(DataLayerError::validation("event key must not be empty"));
        }

        let mut tables = self.tables.write();
        let table = tables.entry(event.entity.clone()).or_default();
        match event.op {
            EventOp::Upsert => {
                table.insert(event.key.clone(), event.payload.clone());
            }
            EventOp::Delete => {
                // Deleting a missing key is an idempotent no-op
                table.remove(&event.key);
            }
        }
        debug!(
            "Memory layer '{}': {} {}/{} at scn {}",
            self.destination, event.op, event.entity, event.key, event.scn
        );
        Ok(Ack::at(event.scn))
    }
}

/// Factory producing a single shared [`MemoryDataLayer`].
pub struct MemoryDataLayerFactory {
    destination: String,
    instance: OnceLock<Arc<MemoryDataLayer>>,
}

impl MemoryDataLayerFactory {
    /// Create a factory for the given destination tag.
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            instance: OnceLock::new(),
        }
    }

    /// The shared instance, for inspecting destination state in tests.
    pub fn instance(&self) -> Arc<MemoryDataLayer> {
        self.instance
            .get_or_init(|| Arc::new(MemoryDataLayer::new(self.destination.clone())))
            .clone()
    }
}

impl DataLayerFactory for MemoryDataLayerFactory {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn create(&self) -> Result<Arc<dyn DataLayer>> {
        Ok(self.instance())
    }
}
