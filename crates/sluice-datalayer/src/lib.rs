//! # sluice-datalayer - Destination data layers for the sluice CDC relay
//!
//! The pluggable sink side of the relay: a [`DataLayer`] applies one change
//! event at a time, idempotently, keyed by primary key and operation type.
//!
//! ```text
//! dispatch loop ──apply(event)──► DataLayer (one shared instance per type)
//!                                    │
//!                  ┌─────────────────┼──────────────────┐
//!                  ▼                 ▼                  ▼
//!           MemoryDataLayer    SqlDataLayer        (custom impls)
//! ```
//!
//! Instances are created by a [`DataLayerFactory`] and held in a
//! [`DestinationRegistry`] — exactly one live instance per destination type
//! per process, shared by every dispatch loop of that type.

mod error;
mod layer;
mod memory;
mod sql;

pub use error::{DataLayerError, Result};
pub use layer::{Ack, DataLayer, DataLayerFactory, DestinationRegistry};
pub use memory::{MemoryDataLayer, MemoryDataLayerFactory};
pub use sql::{SqlClient, SqlDataLayer, SqlDataLayerFactory, SqlHandleMap, SqlParams};
