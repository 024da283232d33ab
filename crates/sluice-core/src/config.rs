//! Configuration types for the relay
//!
//! Architecture:
//!   Sources → EventProducer (per partition) → EventWindow
//!   EventWindow → dispatch loops (partition × destination) → data layers

use crate::error::{Error, Result};
use crate::model::PhysicalPartition;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Root relay configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Checkpoint storage settings
    #[serde(default)]
    pub checkpoint: CheckpointSettings,

    /// Per-partition window settings
    #[serde(default)]
    pub window: WindowSettings,

    /// Event producer settings
    #[serde(default)]
    pub producer: ProducerSettings,

    /// Dispatch loop settings
    #[serde(default)]
    pub dispatch: DispatchSettings,

    /// Physical partitions to capture
    pub partitions: Vec<PartitionSettings>,

    /// Destination type tags to dispatch to
    #[serde(default)]
    pub destinations: Vec<String>,
}

impl RelayConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.partitions.is_empty() {
            return Err(Error::config("at least one partition is required"));
        }

        let mut seen = HashSet::new();
        for p in &self.partitions {
            if p.source.is_empty() {
                return Err(Error::config("partition source must not be empty"));
            }
            if !seen.insert(p.partition()) {
                return Err(Error::config(format!(
                    "duplicate partition: {}",
                    p.partition()
                )));
            }
        }

        let mut dests = HashSet::new();
        for dest in &self.destinations {
            if dest.is_empty() || dest.contains('/') || dest.contains('\\') {
                return Err(Error::config(format!("invalid destination tag: {:?}", dest)));
            }
            if !dests.insert(dest.as_str()) {
                return Err(Error::config(format!("duplicate destination: {}", dest)));
            }
        }

        if self.window.capacity == 0 {
            return Err(Error::config("window capacity must be at least 1"));
        }
        if self.window.max_retained < self.window.capacity {
            return Err(Error::config(
                "window max_retained must be >= capacity",
            ));
        }

        Ok(())
    }
}

/// Checkpoint storage settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointSettings {
    /// Directory for the file store; None = in-memory (no restart durability)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Whether to fsync checkpoint writes
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: None,
            fsync: default_fsync(),
        }
    }
}

fn default_fsync() -> bool {
    true
}

/// Per-partition window settings
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct WindowSettings {
    /// Soft capacity: acknowledged entries are evicted past this
    #[serde(default = "default_window_capacity")]
    pub capacity: usize,

    /// Hard retention cap: oldest entries are dropped past this
    #[serde(default = "default_window_max_retained")]
    pub max_retained: usize,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            capacity: default_window_capacity(),
            max_retained: default_window_max_retained(),
        }
    }
}

fn default_window_capacity() -> usize {
    1024
}

fn default_window_max_retained() -> usize {
    8192
}

/// Event producer settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerSettings {
    /// Wait between polls that return no changes (milliseconds)
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,

    /// Consecutive transient failures before the producer goes ERRORED
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Retry policy for source I/O
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            idle_wait_ms: default_idle_wait_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            retry: RetrySettings::default(),
        }
    }
}

fn default_idle_wait_ms() -> u64 {
    100
}

fn default_max_consecutive_failures() -> u32 {
    5
}

/// Dispatch loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchSettings {
    /// Maximum events fetched from the window per read
    #[serde(default = "default_dispatch_batch_size")]
    pub batch_size: usize,

    /// Bounded wait for new events before re-checking shutdown (milliseconds)
    #[serde(default = "default_dispatch_wait_ms")]
    pub wait_ms: u64,

    /// Policy for destination validation errors
    #[serde(default)]
    pub on_validation_error: ValidationErrorPolicy,

    /// Retry policy for transient destination errors
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_dispatch_batch_size(),
            wait_ms: default_dispatch_wait_ms(),
            on_validation_error: ValidationErrorPolicy::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl DispatchSettings {
    /// Bounded wait as a Duration.
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

fn default_dispatch_batch_size() -> usize {
    256
}

fn default_dispatch_wait_ms() -> u64 {
    500
}

/// What to do when a destination reports a validation error.
///
/// Default is halt-and-alert: a silent skip risks silent data loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorPolicy {
    /// Stop the dispatch loop and raise an operator-visible alert
    #[default]
    HaltAndAlert,
    /// Record the event in the dead-letter queue and advance
    DeadLetter,
}

/// Serializable retry policy, converted to [`RetryConfig`] at runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    /// Maximum retry attempts (-1 = infinite, 0 = disabled)
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// Base delay between retries (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Maximum delay cap (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter factor (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    /// Convert to a runtime retry config.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(self.max_retries)
            .retry_delay(Duration::from_millis(self.retry_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .jitter(self.jitter)
            .build()
    }
}

fn default_max_retries() -> i32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.25
}

/// One captured partition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionSettings {
    /// Source identifier
    pub source: String,

    /// Partition number within the source
    pub id: u32,

    /// Where to start when no capture checkpoint exists
    #[serde(default)]
    pub bootstrap: BootstrapPolicy,
}

impl PartitionSettings {
    /// The partition identifier.
    pub fn partition(&self) -> PhysicalPartition {
        PhysicalPartition::new(self.source.clone(), self.id)
    }
}

/// Bootstrap point for a partition with no capture checkpoint.
///
/// A checkpointed partition always resumes from its checkpoint; this policy
/// only applies on first start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPolicy {
    /// Start from the earliest change the source retains
    #[default]
    Earliest,
    /// Start from the current tail of the source
    Latest,
}

impl fmt::Display for BootstrapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => write!(f, "earliest"),
            Self::Latest => write!(f, "latest"),
        }
    }
}
