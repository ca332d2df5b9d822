pub mod checkpoint;
pub mod duckdb;
pub mod traits;

pub use checkpoint::{
    BatchPlan, BatchStats, CheckpointError, CheckpointManager, CheckpointRecord, CheckpointSummary,
    Recovery,
};
pub use self::duckdb::DuckDbCheckpointStore;
pub use traits::{CheckpointStore, StorageError};
