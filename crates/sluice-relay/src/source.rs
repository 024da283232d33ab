//! Change source interface
//!
//! Source-agnostic trait for pulling raw changes from one physical
//! partition, plus in-memory implementations for tests and demos. The relay
//! never constructs connections — the embedding process hands it one opened
//! source per configured partition.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use sluice_core::{EventOp, Scn};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Where a source stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePosition {
    /// Earliest change the source retains
    Earliest,
    /// Current tail of the source
    Latest,
    /// Immediately after the given scn (resume from checkpoint)
    After(Scn),
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => write!(f, "earliest"),
            Self::Latest => write!(f, "latest"),
            Self::After(scn) => write!(f, "after({})", scn),
        }
    }
}

/// A raw change pulled from a source, before sequencing.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceChange {
    /// Native sequence number, when the source guarantees monotonic
    /// non-reused numbering; None = the producer assigns.
    pub scn: Option<Scn>,
    /// Table / entity identifier
    pub entity: String,
    /// Operation type
    pub op: EventOp,
    /// Primary key of the affected record
    pub key: String,
    /// Record payload (null for deletes)
    pub payload: serde_json::Value,
}

impl SourceChange {
    /// Create a raw UPSERT change.
    pub fn upsert(
        entity: impl Into<String>,
        key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            scn: None,
            entity: entity.into(),
            op: EventOp::Upsert,
            key: key.into(),
            payload,
        }
    }

    /// Create a raw DELETE change.
    pub fn delete(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scn: None,
            entity: entity.into(),
            op: EventOp::Delete,
            key: key.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Attach the source's native sequence number.
    pub fn with_scn(mut self, scn: Scn) -> Self {
        self.scn = Some(scn);
        self
    }
}

/// Trait for change-stream sources.
///
/// Implementations pull from one physical partition. `poll` may block on
/// I/O; an empty batch means nothing new is available yet.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open the stream at the given position.
    async fn open(&mut self, position: SourcePosition) -> Result<()>;

    /// Pull the next batch of raw changes.
    async fn poll(&mut self) -> Result<Vec<SourceChange>>;

    /// Release source resources.
    async fn close(&mut self) -> Result<()>;
}

/// One scripted poll outcome.
enum ScriptedPoll {
    Changes(Vec<SourceChange>),
    TransientFailure(String),
}

/// Deterministic in-memory source for tests and demos.
///
/// Serves scripted batches in order; scripted failures surface as transient
/// source errors so producer retry paths can be exercised. Once the script
/// is exhausted, polls return empty batches.
pub struct ScriptedSource {
    label: String,
    script: VecDeque<ScriptedPoll>,
    opened_at: Option<SourcePosition>,
}

impl ScriptedSource {
    /// Create an empty scripted source.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            script: VecDeque::new(),
            opened_at: None,
        }
    }

    /// Append a batch of changes to the script.
    pub fn push_changes(mut self, changes: Vec<SourceChange>) -> Self {
        self.script.push_back(ScriptedPoll::Changes(changes));
        self
    }

    /// Append a transient failure to the script.
    pub fn push_failure(mut self, reason: impl Into<String>) -> Self {
        self.script
            .push_back(ScriptedPoll::TransientFailure(reason.into()));
        self
    }

    /// Position the source was opened at, if opened.
    pub fn opened_at(&self) -> Option<SourcePosition> {
        self.opened_at
    }
}

#[async_trait]
impl ChangeSource for ScriptedSource {
    async fn open(&mut self, position: SourcePosition) -> Result<()> {
        debug!("Scripted source '{}' opened at {}", self.label, position);
        self.opened_at = Some(position);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<SourceChange>> {
        if self.opened_at.is_none() {
            return Err(RelayError::source_fatal(&self.label, "source not opened"));
        }
        match self.script.pop_front() {
            Some(ScriptedPoll::Changes(changes)) => Ok(changes),
            Some(ScriptedPoll::TransientFailure(reason)) => {
                Err(RelayError::source_transient(&self.label, reason))
            }
            None => Ok(Vec::new()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.opened_at = None;
        Ok(())
    }
}

/// Source fed at runtime through an unbounded channel.
///
/// Tests and demos push batches through the sender while the relay runs.
/// A closed channel drains to empty polls rather than erroring.
pub struct ChannelSource {
    label: String,
    rx: mpsc::UnboundedReceiver<Vec<SourceChange>>,
    opened: bool,
}

/// Create a channel-fed source and its sender.
pub fn channel_source(
    label: impl Into<String>,
) -> (mpsc::UnboundedSender<Vec<SourceChange>>, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        tx,
        ChannelSource {
            label: label.into(),
            rx,
            opened: false,
        },
    )
}

#[async_trait]
impl ChangeSource for ChannelSource {
    async fn open(&mut self, position: SourcePosition) -> Result<()> {
        debug!("Channel source '{}' opened at {}", self.label, position);
        self.opened = true;
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<SourceChange>> {
        if !self.opened {
            return Err(RelayError::source_fatal(&self.label, "source not opened"));
        }
        match self.rx.try_recv() {
            Ok(batch) => Ok(batch),
            Err(mpsc::error::TryRecvError::Empty) => Ok(Vec::new()),
            Err(mpsc::error::TryRecvError::Disconnected) => Ok(Vec::new()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.opened = false;
        self.rx.close();
        Ok(())
    }
}
