//! Sequence number tracking
//!
//! Durable per-partition checkpoint state — the only state that must survive
//! process restart. A checkpoint records the highest scn safely processed for
//! a role (capture, or dispatch to one destination); resume always starts at
//! checkpoint + 1.
//!
//! ## Guarantees
//!
//! - **Durable**: a `set` that returns success survives restart; the file
//!   backend writes a temp file, fsyncs, then renames.
//! - **All-or-nothing**: a failed `set` leaves the stored value untouched.
//! - **Monotonic**: a `set` with `scn <= current` fails with
//!   [`Error::StaleCheckpoint`] instead of silently regressing.
//! - **Concurrent**: writers for distinct `(partition, role)` keys proceed
//!   in parallel; writers for the same key are serialized.

use crate::error::{Error, Result};
use crate::model::{CheckpointRole, PhysicalPartition, Scn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

type TrackerKey = (PhysicalPartition, CheckpointRole);

/// Persisted checkpoint record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Partition the checkpoint belongs to
    pub partition: PhysicalPartition,
    /// Role the checkpoint is recorded under
    pub role: CheckpointRole,
    /// Highest safely-processed scn
    pub scn: Scn,
    /// Last update timestamp (epoch milliseconds)
    pub updated_at: i64,
}

/// Trait for checkpoint storage backends.
#[async_trait::async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Durably record `scn` for `(partition, role)`.
    async fn persist(
        &self,
        partition: &PhysicalPartition,
        role: &CheckpointRole,
        scn: Scn,
    ) -> Result<()>;

    /// Load the recorded scn for `(partition, role)`, if any.
    async fn load(
        &self,
        partition: &PhysicalPartition,
        role: &CheckpointRole,
    ) -> Result<Option<Scn>>;
}

/// Shared checkpoint backend.
pub type SharedCheckpointBackend = Arc<dyn CheckpointBackend>;

/// File-based checkpoint store.
///
/// One JSON file per `(partition, role)` key, written atomically
/// (temp file + fsync + rename).
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    fsync: bool,
}

impl FileCheckpointStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Create a store with an explicit fsync policy.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        info!("Checkpoint store at {}", base_dir.display());
        Ok(Self { base_dir, fsync })
    }

    fn file_path(&self, partition: &PhysicalPartition, role: &CheckpointRole) -> Result<PathBuf> {
        let role_tag = match role {
            CheckpointRole::Capture => "capture".to_string(),
            CheckpointRole::Dispatch(dest) => {
                if dest.is_empty() || dest.contains('/') || dest.contains('\\') {
                    return Err(Error::checkpoint(format!(
                        "invalid destination tag: {:?}",
                        dest
                    )));
                }
                format!("dispatch-{}", dest)
            }
        };
        if partition.source.is_empty()
            || partition.source.contains('/')
            || partition.source.contains('\\')
        {
            return Err(Error::checkpoint(format!(
                "invalid partition source: {:?}",
                partition.source
            )));
        }
        Ok(self.base_dir.join(format!(
            "{}-{}.{}.json",
            partition.source, partition.id, role_tag
        )))
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for FileCheckpointStore {
    async fn persist(
        &self,
        partition: &PhysicalPartition,
        role: &CheckpointRole,
        scn: Scn,
    ) -> Result<()> {
        let file_path = self.file_path(partition, role)?;
        let temp_path = file_path.with_extension("tmp");

        let record = CheckpointRecord {
            partition: partition.clone(),
            role: role.clone(),
            scn,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }

        // Atomic rename: readers never observe a partial write
        fs::rename(&temp_path, &file_path).await?;

        debug!("Checkpoint {} ({}) -> {}", partition, role, scn);
        Ok(())
    }

    async fn load(
        &self,
        partition: &PhysicalPartition,
        role: &CheckpointRole,
    ) -> Result<Option<Scn>> {
        let file_path = self.file_path(partition, role)?;
        if !file_path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&file_path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        let record: CheckpointRecord = serde_json::from_str(&contents)?;
        if record.partition != *partition || record.role != *role {
            warn!(
                "Checkpoint file {} names {} ({}), expected {} ({})",
                file_path.display(),
                record.partition,
                record.role,
                partition,
                role
            );
            return Err(Error::checkpoint(format!(
                "checkpoint file mismatch at {}",
                file_path.display()
            )));
        }
        Ok(Some(record.scn))
    }
}

/// In-memory checkpoint store for tests and ephemeral relays.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<TrackerKey, Scn>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for MemoryCheckpointStore {
    async fn persist(
        &self,
        partition: &PhysicalPartition,
        role: &CheckpointRole,
        scn: Scn,
    ) -> Result<()> {
        self.checkpoints
            .write()
            .insert((partition.clone(), role.clone()), scn);
        Ok(())
    }

    async fn load(
        &self,
        partition: &PhysicalPartition,
        role: &CheckpointRole,
    ) -> Result<Option<Scn>> {
        Ok(self
            .checkpoints
            .read()
            .get(&(partition.clone(), role.clone()))
            .copied())
    }
}

/// Durable, monotonic sequence number tracker.
///
/// Wraps a [`CheckpointBackend`] with a read cache and compare-and-set
/// monotonicity enforcement.
pub struct SequenceTracker {
    backend: SharedCheckpointBackend,
    /// Last known value per key; authoritative once populated because all
    /// writes go through this tracker.
    current: RwLock<HashMap<TrackerKey, Scn>>,
    /// Per-key write serialization; distinct keys do not contend.
    key_locks: Mutex<HashMap<TrackerKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SequenceTracker {
    /// Create a tracker over the given backend.
    pub fn new(backend: SharedCheckpointBackend) -> Self {
        Self {
            backend,
            current: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a tracker over an in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()))
    }

    fn key_lock(&self, key: &TrackerKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock();
        locks.entry(key.clone()).or_default().clone()
    }

    /// Get the checkpoint for `(partition, role)`, if any.
    pub async fn get(
        &self,
        partition: &PhysicalPartition,
        role: &CheckpointRole,
    ) -> Result<Option<Scn>> {
        let key = (partition.clone(), role.clone());
        if let Some(scn) = self.current.read().get(&key).copied() {
            return Ok(Some(scn));
        }

        let loaded = self.backend.load(partition, role).await?;
        if let Some(scn) = loaded {
            self.current.write().insert(key, scn);
        }
        Ok(loaded)
    }

    /// Record `scn` as the checkpoint for `(partition, role)`.
    ///
    /// Fails with [`Error::StaleCheckpoint`] when `scn` does not advance the
    /// stored value; fails without updating any state when the backend write
    /// fails.
    pub async fn set(
        &self,
        partition: &PhysicalPartition,
        role: &CheckpointRole,
        scn: Scn,
    ) -> Result<()> {
        let key = (partition.clone(), role.clone());
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let cached = self.current.read().get(&key).copied();
        let current = match cached {
            Some(scn) => Some(scn),
            None => self.backend.load(partition, role).await?,
        };

        if let Some(current) = current {
            if scn <= current {
                return Err(Error::StaleCheckpoint {
                    partition: partition.clone(),
                    role: role.clone(),
                    current,
                    attempted: scn,
                });
            }
        }

        self.backend.persist(partition, role, scn).await?;
        self.current.write().insert(key, scn);
        Ok(())
    }

    /// Minimum dispatch checkpoint across `destinations` for a partition.
    ///
    /// A destination with no checkpoint yet contributes 0, so nothing is
    /// evictable until every destination has acknowledged something.
    pub async fn min_dispatch(
        &self,
        partition: &PhysicalPartition,
        destinations: &[String],
    ) -> Result<Scn> {
        let mut min = Scn::MAX;
        for dest in destinations {
            let scn = self
                .get(partition, &CheckpointRole::dispatch(dest.clone()))
                .await?
                .unwrap_or(0);
            min = min.min(scn);
        }
        if destinations.is_empty() {
            Ok(0)
        } else {
            Ok(min)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn partition() -> PhysicalPartition {
        PhysicalPartition::new("orders", 0)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let tracker = SequenceTracker::in_memory();
        let p = partition();

        assert_eq!(tracker.get(&p, &CheckpointRole::Capture).await.unwrap(), None);

        tracker.set(&p, &CheckpointRole::Capture, 5).await.unwrap();
        assert_eq!(
            tracker.get(&p, &CheckpointRole::Capture).await.unwrap(),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_stale_checkpoint_rejected() {
        let tracker = SequenceTracker::in_memory();
        let p = partition();
        let role = CheckpointRole::dispatch("hbase-delete");

        tracker.set(&p, &role, 7).await.unwrap();

        // Equal and lower are both rejected, stored value untouched
        for attempted in [7, 3] {
            let err = tracker.set(&p, &role, attempted).await.unwrap_err();
            match err {
                Error::StaleCheckpoint {
                    current, attempted: a, ..
                } => {
                    assert_eq!(current, 7);
                    assert_eq!(a, attempted);
                }
                other => panic!("expected StaleCheckpoint, got {other}"),
            }
        }
        assert_eq!(tracker.get(&p, &role).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_roles_are_independent() {
        let tracker = SequenceTracker::in_memory();
        let p = partition();

        tracker.set(&p, &CheckpointRole::Capture, 10).await.unwrap();
        tracker
            .set(&p, &CheckpointRole::dispatch("d1"), 3)
            .await
            .unwrap();
        tracker
            .set(&p, &CheckpointRole::dispatch("d2"), 8)
            .await
            .unwrap();

        assert_eq!(
            tracker.get(&p, &CheckpointRole::Capture).await.unwrap(),
            Some(10)
        );
        assert_eq!(
            tracker
                .min_dispatch(&p, &["d1".into(), "d2".into()])
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_min_dispatch_missing_destination_is_zero() {
        let tracker = SequenceTracker::in_memory();
        let p = partition();

        tracker
            .set(&p, &CheckpointRole::dispatch("d1"), 100)
            .await
            .unwrap();

        // d2 has acknowledged nothing yet
        assert_eq!(
            tracker
                .min_dispatch(&p, &["d1".into(), "d2".into()])
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = tempdir().unwrap();
        let p = partition();
        let role = CheckpointRole::dispatch("hbase-delete");

        {
            let store = FileCheckpointStore::new(dir.path()).await.unwrap();
            let tracker = SequenceTracker::new(Arc::new(store));
            tracker.set(&p, &role, 42).await.unwrap();
        }

        // New store over the same directory simulates restart
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        let tracker = SequenceTracker::new(Arc::new(store));
        assert_eq!(tracker.get(&p, &role).await.unwrap(), Some(42));

        // Monotonicity is enforced against the reloaded value
        assert!(tracker.set(&p, &role, 42).await.is_err());
        tracker.set(&p, &role, 43).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_bad_destination_tag() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        let p = partition();

        let err = store
            .persist(&p, &CheckpointRole::dispatch("a/b"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    #[tokio::test]
    async fn test_concurrent_distinct_keys() {
        let tracker = Arc::new(SequenceTracker::in_memory());

        let mut handles = Vec::new();
        for id in 0..8u32 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let p = PhysicalPartition::new("orders", id);
                for scn in 1..=50 {
                    tracker.set(&p, &CheckpointRole::Capture, scn).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for id in 0..8u32 {
            let p = PhysicalPartition::new("orders", id);
            assert_eq!(
                tracker.get(&p, &CheckpointRole::Capture).await.unwrap(),
                Some(50)
            );
        }
    }
}
