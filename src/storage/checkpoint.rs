use super::traits::{CheckpointStore, StorageError};
use crate::dedup::DedupSnapshot;
use crate::sink::PublishedFile;
use crate::source::DataLossGap;
use crate::watermark::WatermarkSnapshot;
use crate::window::WindowSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid checkpoint version: {0}")]
    InvalidVersion(u32),

    #[error("Out-of-order commit for stream '{stream_id}': expected batch {expected}, got {got}")]
    OutOfOrder {
        stream_id: String,
        expected: u64,
        got: u64,
    },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Input range of one batch, recorded before the batch is processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub stream_id: String,
    pub batch_id: u64,
    /// First offset read per partition
    pub start: BTreeMap<u32, u64>,
    /// Offset after the last entry read per partition
    pub end: BTreeMap<u32, u64>,
    /// Gaps acknowledged while planning, committed with this batch
    #[serde(default)]
    pub data_loss: Vec<DataLossGap>,
}

impl BatchPlan {
    /// Partitions that contribute at least one entry
    pub fn ranges(&self) -> impl Iterator<Item = (u32, u64, u64)> + '_ {
        self.end.iter().filter_map(|(partition, end)| {
            let start = self.start.get(partition).copied().unwrap_or(*end);
            (start < *end).then_some((*partition, start, *end))
        })
    }

    /// Nothing to read and no gap to record
    pub fn is_empty(&self) -> bool {
        self.ranges().next().is_none() && self.data_loss.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub events_read: u64,
    pub events_processed: u64,
    pub duplicates: u64,
    /// Dropped by the dedup retention horizon
    pub late_dedup: u64,
    /// Dropped because their window was already finalized
    pub late_window: u64,
    pub malformed: u64,
    pub windows_finalized: u64,
    pub rows_written: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub stream_id: String,
    pub batch_id: u64,
    /// Next offset to read per partition
    pub offsets: BTreeMap<u32, u64>,
    pub watermark: WatermarkSnapshot,
    pub dedup: DedupSnapshot,
    pub windows: WindowSnapshot,
    #[serde(default)]
    pub data_loss: Vec<DataLossGap>,
    #[serde(default)]
    pub stats: BatchStats,
    #[serde(default)]
    pub outputs: Vec<PublishedFile>,
    pub config_fingerprint: String,
    pub committed_at: DateTime<Utc>,
}

/// Condensed form of a record for listings
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub batch_id: u64,
    pub committed_at: DateTime<Utc>,
    pub offsets: BTreeMap<u32, u64>,
    pub max_event_time: Option<DateTime<Utc>>,
    pub dedup_entries: usize,
    pub open_windows: usize,
    pub data_loss: Vec<DataLossGap>,
    pub stats: BatchStats,
    pub outputs: Vec<PublishedFile>,
}

impl From<&CheckpointRecord> for CheckpointSummary {
    fn from(record: &CheckpointRecord) -> Self {
        Self {
            batch_id: record.batch_id,
            committed_at: record.committed_at,
            offsets: record.offsets.clone(),
            max_event_time: record
                .watermark
                .max_event_time
                .get(&record.stream_id)
                .copied(),
            dedup_entries: record.dedup.entries.len(),
            open_windows: record.windows.windows.len(),
            data_loss: record.data_loss.clone(),
            stats: record.stats.clone(),
            outputs: record.outputs.clone(),
        }
    }
}

/// What a stream resumes from after a restart
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    pub last: Option<CheckpointRecord>,
    /// Plan of a batch that was started but never committed
    pub pending_plan: Option<BatchPlan>,
}

/// Sequences batch ids and commits for a single stream
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    stream_id: String,
    retain: usize,
    last_batch_id: u64,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, stream_id: impl Into<String>, retain: usize) -> Self {
        Self {
            store,
            stream_id: stream_id.into(),
            retain: retain.max(1),
            last_batch_id: 0,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Batch id of the last committed record, 0 if none
    pub fn last_batch_id(&self) -> u64 {
        self.last_batch_id
    }

    pub async fn recover(&mut self) -> Result<Recovery> {
        tracing::info!(stream = %self.stream_id, "Loading checkpoint from storage");

        let last = self.store.last_checkpoint(&self.stream_id).await?;
        if let Some(record) = &last {
            if record.version != CURRENT_VERSION {
                tracing::error!(
                    stream = %self.stream_id,
                    "Checkpoint version mismatch: {} vs {}",
                    record.version,
                    CURRENT_VERSION
                );
                return Err(CheckpointError::InvalidVersion(record.version));
            }
            self.last_batch_id = record.batch_id;
            tracing::info!(
                stream = %self.stream_id,
                batch_id = record.batch_id,
                "Loaded checkpoint committed at {}",
                record.committed_at
            );
        } else {
            self.last_batch_id = 0;
            tracing::info!(stream = %self.stream_id, "No checkpoint found, starting fresh");
        }

        let pending_plan = self.store.pending_plan(&self.stream_id).await?;
        if let Some(plan) = &pending_plan {
            tracing::info!(
                stream = %self.stream_id,
                batch_id = plan.batch_id,
                "Found uncommitted batch plan, will replay it"
            );
        }

        Ok(Recovery { last, pending_plan })
    }

    /// Id of the next batch. Stays the same until that batch commits.
    pub fn begin_batch(&self) -> u64 {
        self.last_batch_id + 1
    }

    pub async fn record_plan(&self, plan: &BatchPlan) -> Result<()> {
        self.expect_next(plan.batch_id)?;
        self.store.save_plan(plan).await?;
        Ok(())
    }

    /// Durably append the record of the batch begun last
    pub async fn commit(&mut self, record: &CheckpointRecord) -> Result<()> {
        self.expect_next(record.batch_id)?;
        self.store.append_checkpoint(record).await?;
        self.last_batch_id = record.batch_id;
        tracing::debug!(stream = %self.stream_id, batch_id = record.batch_id, "Checkpoint committed");

        // Audit trimming is best-effort; the record above is already durable.
        match self.store.prune(&self.stream_id, self.retain).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(stream = %self.stream_id, removed, "Pruned old checkpoints"),
            Err(e) => tracing::warn!(stream = %self.stream_id, "Failed to prune checkpoints: {}", e),
        }
        Ok(())
    }

    fn expect_next(&self, batch_id: u64) -> Result<()> {
        let expected = self.begin_batch();
        if batch_id != expected {
            return Err(CheckpointError::OutOfOrder {
                stream_id: self.stream_id.clone(),
                expected,
                got: batch_id,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::duckdb::DuckDbCheckpointStore;

    async fn setup_store() -> Arc<dyn CheckpointStore> {
        let store = DuckDbCheckpointStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        Arc::new(store) as Arc<dyn CheckpointStore>
    }

    fn record(batch_id: u64, version: u32) -> CheckpointRecord {
        CheckpointRecord {
            version,
            stream_id: "clicks".to_string(),
            batch_id,
            offsets: BTreeMap::from([(0, 3), (1, 7)]),
            watermark: WatermarkSnapshot::default(),
            dedup: DedupSnapshot::default(),
            windows: WindowSnapshot::default(),
            data_loss: Vec::new(),
            stats: BatchStats::default(),
            outputs: Vec::new(),
            config_fingerprint: String::new(),
            committed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fresh_stream_starts_at_batch_one() {
        let mut manager = CheckpointManager::new(setup_store().await, "clicks", 10);
        let recovery = manager.recover().await.unwrap();
        assert!(recovery.last.is_none());
        assert!(recovery.pending_plan.is_none());
        assert_eq!(manager.begin_batch(), 1);
    }

    #[tokio::test]
    async fn test_commit_advances_batch_id() {
        let store = setup_store().await;
        let mut manager = CheckpointManager::new(store.clone(), "clicks", 10);
        manager.recover().await.unwrap();

        manager.commit(&record(1, CURRENT_VERSION)).await.unwrap();
        assert_eq!(manager.begin_batch(), 2);

        let mut restarted = CheckpointManager::new(store, "clicks", 10);
        let recovery = restarted.recover().await.unwrap();
        assert_eq!(recovery.last.unwrap().offsets, BTreeMap::from([(0, 3), (1, 7)]));
        assert_eq!(restarted.begin_batch(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_commit_rejected() {
        let mut manager = CheckpointManager::new(setup_store().await, "clicks", 10);
        manager.recover().await.unwrap();

        let err = manager.commit(&record(3, CURRENT_VERSION)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::OutOfOrder { expected: 1, got: 3, .. }));
    }

    #[tokio::test]
    async fn test_pending_plan_recovered() {
        let store = setup_store().await;
        let mut manager = CheckpointManager::new(store.clone(), "clicks", 10);
        manager.recover().await.unwrap();

        let plan = BatchPlan {
            stream_id: "clicks".to_string(),
            batch_id: 1,
            start: BTreeMap::from([(0, 0), (1, 4)]),
            end: BTreeMap::from([(0, 3), (1, 4)]),
            data_loss: vec![DataLossGap {
                partition: 1,
                from: 2,
                to: 4,
                detected_at: Utc::now(),
            }],
        };
        manager.record_plan(&plan).await.unwrap();
        assert_eq!(plan.ranges().collect::<Vec<_>>(), vec![(0, 0, 3)]);

        let mut restarted = CheckpointManager::new(store, "clicks", 10);
        let recovery = restarted.recover().await.unwrap();
        assert_eq!(recovery.pending_plan, Some(plan));
    }

    #[test]
    fn test_plan_with_only_a_gap_is_not_empty() {
        let mut plan = BatchPlan {
            stream_id: "clicks".to_string(),
            batch_id: 4,
            start: BTreeMap::from([(0, 9)]),
            end: BTreeMap::from([(0, 9)]),
            data_loss: Vec::new(),
        };
        assert!(plan.is_empty());

        plan.data_loss.push(DataLossGap {
            partition: 0,
            from: 5,
            to: 9,
            detected_at: Utc::now(),
        });
        assert!(!plan.is_empty());
        assert_eq!(plan.ranges().count(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_version_mismatch() {
        let store = setup_store().await;
        // Written directly to bypass the manager
        store.append_checkpoint(&record(1, 999)).await.unwrap();

        let mut manager = CheckpointManager::new(store, "clicks", 10);
        let err = manager.recover().await.unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidVersion(999)));
    }
}
