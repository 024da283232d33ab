//! SQL-template data layer
//!
//! Destination adapter in the shape of the classic JDBC upsert/delete
//! handlers: a per-operation statement template rendered against the event's
//! entity and executed on a named handle. Statement execution itself lives
//! behind [`SqlClient`] — connection pooling and dialect details are the
//! embedding process's concern.

use crate::error::{DataLayerError, Result};
use crate::layer::{Ack, DataLayer, DataLayerFactory};
use async_trait::async_trait;
use sluice_core::{ChangeEvent, EventOp};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Named parameters passed to a statement execution.
pub type SqlParams = HashMap<String, serde_json::Value>;

/// Map of named SQL handles (the connection-template stand-in).
pub type SqlHandleMap = HashMap<String, Arc<dyn SqlClient>>;

/// Executes one statement with named parameters, returning affected rows.
#[async_trait]
pub trait SqlClient: Send + Sync {
    async fn execute(&self, statement: &str, params: &SqlParams) -> Result<u64>;
}

/// Data layer that renders per-operation statement templates.
///
/// The handle is chosen by the event's source name, falling back to the
/// configured default. Templates use `{table}` for the entity and the named
/// parameters `:key`, `:payload`, `:scn`. The upsert template is expected to
/// be a true upsert and the delete template keyed by primary key, which makes
/// `apply` idempotent; a delete affecting zero rows is a successful no-op.
pub struct SqlDataLayer {
    destination: String,
    handles: SqlHandleMap,
    default_handle: String,
    upsert_template: String,
    delete_template: String,
}

impl SqlDataLayer {
    /// Create a layer over the given handle map with default templates.
    pub fn new(destination: impl Into<String>, handles: SqlHandleMap) -> Self {
        Self {
            destination: destination.into(),
            handles,
            default_handle: "default".to_string(),
            upsert_template: "UPSERT INTO {table} (entity_key, payload) VALUES (:key, :payload)"
                .to_string(),
            delete_template: "DELETE FROM {table} WHERE entity_key = :key".to_string(),
        }
    }

    /// Set the fallback handle name.
    pub fn with_default_handle(mut self, handle: impl Into<String>) -> Self {
        self.default_handle = handle.into();
        self
    }

    /// Set the statement templates.
    pub fn with_templates(
        mut self,
        upsert: impl Into<String>,
        delete: impl Into<String>,
    ) -> Self {
        self.upsert_template = upsert.into();
        self.delete_template = delete.into();
        self
    }

    fn handle_for(&self, source: &str) -> Result<&Arc<dyn SqlClient>> {
        self.handles
            .get(source)
            .or_else(|| self.handles.get(&self.default_handle))
            .ok_or_else(|| {
                DataLayerError::fatal(format!(
                    "no SQL handle for source '{}' and no '{}' fallback",
                    source, self.default_handle
                ))
            })
    }

    fn render(&self, event: &ChangeEvent) -> Result<String> {
        // The entity lands in the statement as an identifier; restrict it
        // rather than trusting upstream input.
        if event.entity.is_empty()
            || !event
                .entity
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(DataLayerError::validation(format!(
                "entity is not a valid identifier: {:?}",
                event.entity
            )));
        }
        let template = match event.op {
            EventOp::Upsert => &self.upsert_template,
            EventOp::Delete => &self.delete_template,
        };
        Ok(template.replace("{table}", &event.entity))
    }
}

#[async_trait]
impl DataLayer for SqlDataLayer {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<Ack> {
        if event.key.is_empty() {
            return Err(DataLayerError::validation("event key must not be empty"));
        }

        let statement = self.render(event)?;
        let handle = self.handle_for(&event.partition.source)?;

        let mut params = SqlParams::new();
        params.insert("key".into(), serde_json::Value::String(event.key.clone()));
        params.insert("payload".into(), event.payload.clone());
        params.insert("scn".into(), serde_json::Value::from(event.scn));

        let affected = handle.execute(&statement, &params).await?;
        if affected == 0 && event.op == EventOp::Delete {
            debug!(
                "SQL layer '{}': delete of missing key {}/{} (no-op)",
                self.destination, event.entity, event.key
            );
        }
        Ok(Ack::at(event.scn))
    }
}

/// Factory producing a single shared [`SqlDataLayer`].
///
/// Owns the handle map it was constructed with; `create` always returns the
/// same instance so connection handles are not duplicated across dispatch
/// loops.
pub struct SqlDataLayerFactory {
    destination: String,
    handles: SqlHandleMap,
    default_handle: Option<String>,
    templates: Option<(String, String)>,
    instance: OnceLock<Arc<SqlDataLayer>>,
}

impl SqlDataLayerFactory {
    /// Create a factory for the given destination tag and handle map.
    pub fn new(destination: impl Into<String>, handles: SqlHandleMap) -> Self {
        Self {
            destination: destination.into(),
            handles,
            default_handle: None,
            templates: None,
            instance: OnceLock::new(),
        }
    }

    /// Set the fallback handle name.
    pub fn with_default_handle(mut self, handle: impl Into<String>) -> Self {
        self.default_handle = Some(handle.into());
        self
    }

    /// Set the statement templates.
    pub fn with_templates(
        mut self,
        upsert: impl Into<String>,
        delete: impl Into<String>,
    ) -> Self {
        self.templates = Some((upsert.into(), delete.into()));
        self
    }
}

impl DataLayerFactory for SqlDataLayerFactory {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn create(&self) -> Result<Arc<dyn DataLayer>> {
        let layer = self
            .instance
            .get_or_init(|| {
                let mut layer =
                    SqlDataLayer::new(self.destination.clone(), self.handles.clone());
                if let Some(handle) = &self.default_handle {
                    layer = layer.with_default_handle(handle.clone());
                }
                if let Some((upsert, delete)) = &self.templates {
                    layer = layer.with_templates(upsert.clone(), delete.clone());
                }
                Arc::new(layer)
            })
            .clone();
        Ok(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use sluice_core::PhysicalPartition;

    /// Records executed statements; affected-rows answer is scripted.
    struct RecordingSqlClient {
        executed: Mutex<Vec<(String, SqlParams)>>,
        affected: u64,
    }

    impl RecordingSqlClient {
        fn new(affected: u64) -> Arc<Self> {
            Arc::new(Self {
                executed: Mutex::new(Vec::new()),
                affected,
            })
        }
    }

    #[async_trait]
    impl SqlClient for RecordingSqlClient {
        async fn execute(&self, statement: &str, params: &SqlParams) -> Result<u64> {
            self.executed
                .lock()
                .push((statement.to_string(), params.clone()));
            Ok(self.affected)
        }
    }

    fn partition() -> PhysicalPartition {
        PhysicalPartition::new("orders", 0)
    }

    fn handles(client: Arc<RecordingSqlClient>) -> SqlHandleMap {
        let mut map = SqlHandleMap::new();
        map.insert("orders".to_string(), client);
        map
    }

    #[tokio::test]
    async fn test_upsert_renders_statement() {
        let client = RecordingSqlClient::new(1);
        let layer = SqlDataLayer::new("hbase-upsert", handles(client.clone()));

        let event = ChangeEvent::upsert(partition(), 1, "orders", "o-1", json!({"total": 5}));
        layer.apply(&event).await.unwrap();

        let executed = client.executed.lock();
        assert_eq!(executed.len(), 1);
        let (statement, params) = &executed[0];
        assert!(statement.contains("UPSERT INTO orders"));
        assert_eq!(params["key"], json!("o-1"));
        assert_eq!(params["payload"], json!({"total": 5}));
        assert_eq!(params["scn"], json!(1));
    }

    #[tokio::test]
    async fn test_delete_of_missing_key_is_success() {
        // Zero affected rows
        let client = RecordingSqlClient::new(0);
        let layer = SqlDataLayer::new("hbase-delete", handles(client));

        let event = ChangeEvent::delete(partition(), 3, "orders", "gone");
        let ack = layer.apply(&event).await.unwrap();
        assert_eq!(ack.scn, 3);
    }

    #[tokio::test]
    async fn test_handle_fallback_to_default() {
        let client = RecordingSqlClient::new(1);
        let mut map = SqlHandleMap::new();
        map.insert("default".to_string(), client.clone() as Arc<dyn SqlClient>);
        let layer = SqlDataLayer::new("hbase-delete", map);

        let event = ChangeEvent::delete(PhysicalPartition::new("inventory", 2), 1, "items", "i-1");
        layer.apply(&event).await.unwrap();
        assert_eq!(client.executed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_handle_is_fatal() {
        let layer = SqlDataLayer::new("hbase-delete", SqlHandleMap::new());
        let event = ChangeEvent::delete(partition(), 1, "orders", "o-1");
        let err = layer.apply(&event).await.unwrap_err();
        assert!(matches!(err, DataLayerError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_bad_entity_is_validation_error() {
        let client = RecordingSqlClient::new(1);
        let layer = SqlDataLayer::new("hbase-delete", handles(client));

        let event = ChangeEvent::delete(partition(), 1, "orders; DROP TABLE x", "o-1");
        let err = layer.apply(&event).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_factory_singleton() {
        let client = RecordingSqlClient::new(1);
        let factory = SqlDataLayerFactory::new("hbase-delete", handles(client))
            .with_default_handle("orders")
            .with_templates(
                "UPSERT INTO {table} VALUES (:key, :payload)",
                "DELETE FROM {table} WHERE k = :key",
            );

        let a = factory.create().unwrap();
        let b = factory.create().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.destination(), "hbase-delete");
    }
}
