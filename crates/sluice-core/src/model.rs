//! Core data model
//!
//! The immutable vocabulary shared by every relay component: partitions,
//! sequence numbers, change events, and checkpoint roles. Within one
//! partition events are totally ordered by scn; across partitions there is
//! no global order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sequence/commit number — monotonic per-partition event ordinal.
///
/// `0` means "nothing captured yet"; real events start at 1. Never reused,
/// never decreases within a partition's lifetime.
pub type Scn = u64;

/// One logical shard of a change source, independently sequenced.
///
/// Immutable once assigned; keys producers, windows, and sequence state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalPartition {
    /// Source identifier (e.g. database or upstream name)
    pub source: String,
    /// Partition number within the source
    pub id: u32,
}

impl PhysicalPartition {
    /// Create a new partition identifier.
    pub fn new(source: impl Into<String>, id: u32) -> Self {
        Self {
            source: source.into(),
            id,
        }
    }
}

impl fmt::Display for PhysicalPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

/// Change operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    /// Insert-or-overwrite the destination record at the event key
    Upsert,
    /// Remove the destination record at the event key
    Delete,
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upsert => write!(f, "upsert"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A captured change, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Partition the event was captured from
    pub partition: PhysicalPartition,
    /// Sequence number within the partition
    pub scn: Scn,
    /// Table / entity identifier
    pub entity: String,
    /// Operation type
    pub op: EventOp,
    /// Primary key of the affected record
    pub key: String,
    /// Record payload (empty for deletes)
    pub payload: serde_json::Value,
    /// Capture timestamp (epoch milliseconds)
    pub captured_at: i64,
}

impl ChangeEvent {
    /// Create an UPSERT event.
    pub fn upsert(
        partition: PhysicalPartition,
        scn: Scn,
        entity: impl Into<String>,
        key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            partition,
            scn,
            entity: entity.into(),
            op: EventOp::Upsert,
            key: key.into(),
            payload,
            captured_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a DELETE event.
    pub fn delete(
        partition: PhysicalPartition,
        scn: Scn,
        entity: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            partition,
            scn,
            entity: entity.into(),
            op: EventOp::Delete,
            key: key.into(),
            payload: serde_json::Value::Null,
            captured_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Set an explicit capture timestamp.
    pub fn with_captured_at(mut self, ts_ms: i64) -> Self {
        self.captured_at = ts_ms;
        self
    }
}

/// Role a checkpoint is recorded under.
///
/// `Capture` tracks the highest scn durably appended to the window;
/// `Dispatch` tracks the highest scn acknowledged by one destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointRole {
    /// Highest scn successfully captured into the window
    Capture,
    /// Highest scn acknowledged by the named destination
    Dispatch(String),
}

impl CheckpointRole {
    /// Dispatch role for a destination type tag.
    pub fn dispatch(destination: impl Into<String>) -> Self {
        Self::Dispatch(destination.into())
    }
}

impl fmt::Display for CheckpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => write!(f, "capture"),
            Self::Dispatch(dest) => write!(f, "dispatch:{}", dest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partition_display() {
        let p = PhysicalPartition::new("orders", 3);
        assert_eq!(p.to_string(), "orders:3");
    }

    #[test]
    fn test_partition_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(PhysicalPartition::new("orders", 0), 1u64);
        map.insert(PhysicalPartition::new("orders", 1), 2u64);
        assert_eq!(map.get(&PhysicalPartition::new("orders", 0)), Some(&1));
    }

    #[test]
    fn test_event_constructors() {
        let p = PhysicalPartition::new("orders", 0);
        let up = ChangeEvent::upsert(p.clone(), 1, "orders", "o-42", json!({"total": 99}));
        assert_eq!(up.op, EventOp::Upsert);
        assert_eq!(up.key, "o-42");
        assert_eq!(up.payload["total"], 99);

        let del = ChangeEvent::delete(p, 2, "orders", "o-42");
        assert_eq!(del.op, EventOp::Delete);
        assert!(del.payload.is_null());
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let p = PhysicalPartition::new("orders", 0);
        let event = ChangeEvent::upsert(p, 7, "orders", "o-1", json!({"a": 1}))
            .with_captured_at(1_700_000_000_000);
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: ChangeEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(CheckpointRole::Capture.to_string(), "capture");
        assert_eq!(
            CheckpointRole::dispatch("hbase-delete").to_string(),
            "dispatch:hbase-delete"
        );
    }
}
