use super::checkpoint::{BatchPlan, CheckpointRecord};
use async_trait::async_trait;

/// Durable, append-only home of checkpoint records and batch plans.
///
/// Records are keyed by `(stream_id, batch_id)`; each stream's records are
/// written by that stream's loop alone.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    /// Append one record. Fails with `Conflict` if the batch id is already taken.
    async fn append_checkpoint(&self, record: &CheckpointRecord) -> Result<(), StorageError>;

    /// The record with the highest batch id for a stream
    async fn last_checkpoint(&self, stream_id: &str) -> Result<Option<CheckpointRecord>, StorageError>;

    /// Most recent records first
    async fn checkpoint_history(
        &self,
        stream_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>, StorageError>;

    /// Record the input range of a batch before it is processed
    async fn save_plan(&self, plan: &BatchPlan) -> Result<(), StorageError>;

    /// The lowest recorded plan above the last committed batch, if any
    async fn pending_plan(&self, stream_id: &str) -> Result<Option<BatchPlan>, StorageError>;

    /// Drop all but the newest `retain` records, and plans already committed.
    /// Returns the number of records removed.
    async fn prune(&self, stream_id: &str, retain: usize) -> Result<usize, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint {batch_id} already committed for stream '{stream_id}'")]
    Conflict { stream_id: String, batch_id: u64 },

    #[error("Invalid stored value: {0}")]
    InvalidData(String),
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}
