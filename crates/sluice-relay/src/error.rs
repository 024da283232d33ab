//! Error types for the relay runtime

use sluice_datalayer::DataLayerError;
use thiserror::Error;

/// Result type alias for relay runtime operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay runtime errors
#[derive(Error, Debug)]
pub enum RelayError {
    /// Core error (checkpoints, windows, config)
    #[error(transparent)]
    Core(#[from] sluice_core::Error),

    /// Destination data-layer error
    #[error(transparent)]
    DataLayer(#[from] DataLayerError),

    /// Change source error
    #[error("source error ({partition}): {message}")]
    Source {
        partition: String,
        message: String,
        retryable: bool,
    },

    /// Dispatch loop error
    #[error("dispatch error ({partition} -> {destination}): {message}")]
    Dispatch {
        partition: String,
        destination: String,
        message: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,

    /// Timed out waiting for an operation
    #[error("timeout: {0}")]
    Timeout(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Create a transient source error (retried with backoff)
    pub fn source_transient(partition: impl ToString, msg: impl Into<String>) -> Self {
        Self::Source {
            partition: partition.to_string(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a fatal source error (moves the producer to ERRORED)
    pub fn source_fatal(partition: impl ToString, msg: impl Into<String>) -> Self {
        Self::Source {
            partition: partition.to_string(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a dispatch error
    pub fn dispatch(
        partition: impl ToString,
        destination: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Dispatch {
            partition: partition.to_string(),
            destination: destination.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source { retryable, .. } => *retryable,
            Self::Core(e) => e.is_retriable(),
            Self::DataLayer(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if this is a shutdown error
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}
