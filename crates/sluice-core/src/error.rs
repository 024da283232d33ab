//! Error types for the relay core
//!
//! Every failure mode that crosses a module boundary is a named variant so
//! callers can react precisely: stale checkpoints abort the write, sequence
//! gaps restart the producer, window underflow sends the consumer to resync.

use crate::model::{CheckpointRole, PhysicalPartition, Scn};
use thiserror::Error;

/// Result type for core relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core relay errors
#[derive(Error, Debug)]
pub enum Error {
    /// A checkpoint write attempted to move backwards. An out-of-order
    /// checkpoint would mask data loss, so the write is rejected and the
    /// stored value is left untouched.
    #[error(
        "stale checkpoint for {partition} ({role}): attempted {attempted}, current {current}"
    )]
    StaleCheckpoint {
        partition: PhysicalPartition,
        role: CheckpointRole,
        current: Scn,
        attempted: Scn,
    },

    /// An append did not continue the partition's sequence exactly.
    /// Fatal to that partition's producer; it restarts from its last
    /// capture checkpoint.
    #[error("sequence gap in {partition}: expected scn {expected}, got {got}")]
    SequenceGap {
        partition: PhysicalPartition,
        expected: Scn,
        got: Scn,
    },

    /// A reader requested an scn older than the oldest retained event.
    /// Recoverable by the caller via a full resync, outside this core.
    #[error(
        "window underflow in {partition}: requested scn {requested}, oldest retained {oldest_retained}"
    )]
    WindowUnderflow {
        partition: PhysicalPartition,
        requested: Scn,
        oldest_retained: Scn,
    },

    /// Checkpoint storage failure
    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid state transition or usage
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a checkpoint store error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient failures that may succeed on retry.
    /// Consistency violations (stale checkpoint, sequence gap, underflow)
    /// are never retriable at the call site — they require a state
    /// transition by the owning component.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::WouldBlock
                )
            }
            Self::Checkpoint(msg) => {
                msg.contains("timed out") || msg.contains("temporarily")
            }
            _ => false,
        }
    }
}
