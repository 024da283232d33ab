//! # sluice-relay - Relay runtime for the sluice CDC relay
//!
//! Capture → sequence → buffer → dispatch:
//!
//! ```text
//! ┌────────┐  poll   ┌───────────────┐  append  ┌─────────────┐
//! │ Source │ ──────► │ EventProducer │ ───────► │ EventWindow │
//! └────────┘         └───────────────┘          └──────┬──────┘
//!                        (per partition)               │ read_from
//!                                          ┌───────────┴───────────┐
//!                                          ▼                       ▼
//!                                   ┌──────────────┐        ┌────────────┐
//!                                   │ DispatchLoop │  ...   │ subscribe  │
//!                                   └──────┬───────┘        │  stream    │
//!                                          ▼                └────────────┘
//!                                   ┌──────────────┐
//!                                   │  DataLayer   │ (one per destination)
//!                                   └──────────────┘
//! ```
//!
//! The [`Relay`] composes these pieces from explicit configuration and
//! dependencies — no container callbacks, no process-global registries.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example() -> sluice_relay::Result<()> {
//! use sluice_relay::{channel_source, Relay};
//! use sluice_core::{PhysicalPartition, RelayConfig};
//! use sluice_datalayer::{DataLayerFactory, MemoryDataLayerFactory};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! let config: RelayConfig = serde_json::from_str(r#"{
//!     "partitions": [{"source": "orders", "id": 0}],
//!     "destinations": ["memory"]
//! }"#).expect("static config");
//!
//! let (_tx, source) = channel_source("orders:0");
//! let mut sources: HashMap<_, Box<dyn sluice_relay::ChangeSource>> = HashMap::new();
//! sources.insert(PhysicalPartition::new("orders", 0), Box::new(source));
//!
//! let factories: Vec<Arc<dyn DataLayerFactory>> =
//!     vec![Arc::new(MemoryDataLayerFactory::new("memory"))];
//!
//! let relay = Relay::initialize(config, sources, &factories).await?;
//! relay.start().await?;
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod error;
mod producer;
mod registry;
mod relay;
mod source;

pub use dispatch::{DeadLetterQueue, DeadLetterRecord, DispatchLoop, DispatchState};
pub use error::{RelayError, Result};
pub use producer::{EventProducer, ProducerState};
pub use registry::{ProducerHandle, ProducerRegistry};
pub use relay::{Relay, RelayState};
pub use source::{
    channel_source, ChangeSource, ChannelSource, ScriptedSource, SourceChange, SourcePosition,
};
