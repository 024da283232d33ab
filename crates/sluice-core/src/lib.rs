//! # sluice-core - Core types for the sluice CDC relay
//!
//! Data model, durable sequence tracking, and per-partition event windows
//! shared by the relay runtime and destination data layers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ append   ┌─────────────┐ read_from   ┌───────────────┐
//! │ Producer │ ───────► │ EventWindow │ ──────────► │ dispatch loop │
//! └────┬─────┘          └─────────────┘             └──────┬────────┘
//!      │ capture checkpoint                  dispatch      │
//!      ▼                                     checkpoint    ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │        SequenceTracker  (durable, monotonic CAS)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Within one partition, events are totally ordered by scn; checkpoints are
//! the only state that survives restart.

mod config;
mod error;
mod metrics;
mod model;
mod retry;
mod tracker;
mod window;

pub use config::{
    BootstrapPolicy, CheckpointSettings, DispatchSettings, PartitionSettings, ProducerSettings,
    RelayConfig, RetrySettings, ValidationErrorPolicy, WindowSettings,
};
pub use error::{Error, Result};
pub use metrics::{RelayMetrics, RelayMetricsSnapshot};
pub use model::{ChangeEvent, CheckpointRole, EventOp, PhysicalPartition, Scn};
pub use retry::{ExponentialBackoff, RetryConfig, RetryConfigBuilder};
pub use tracker::{
    CheckpointBackend, CheckpointRecord, FileCheckpointStore, MemoryCheckpointStore,
    SequenceTracker, SharedCheckpointBackend,
};
pub use window::EventWindow;
