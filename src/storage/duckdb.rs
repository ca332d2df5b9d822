use super::checkpoint::{BatchPlan, CheckpointRecord};
use super::traits::{CheckpointStore, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Whether a process with the given PID still exists
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Path::new(&format!("/proc/{}", pid)).exists()
            || std::process::Command::new("ps")
                .arg("-p")
                .arg(pid.to_string())
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// DuckDB reports the holder of a file lock as "... (PID 12345) ..."
fn lock_holder_pid(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_stale_lock(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!("Removed stale {} file: {}", suffix, path.display());
        }
    }
    Ok(())
}

/// Checkpoint store backed by a DuckDB file
pub struct DuckDbCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbCheckpointStore {
    /// Open (or create) the checkpoint database.
    ///
    /// A lock left behind by a process that no longer exists is cleared and
    /// the open retried once.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Database(format!("Failed to create {}: {}", parent.display(), e)))?;
            }
        }

        match Connection::open(path) {
            Ok(conn) => Ok(Self::from_connection(conn)),
            Err(e) => {
                let error_msg = e.to_string();
                if !error_msg.contains("Could not set lock") {
                    return Err(e.into());
                }

                tracing::warn!("Checkpoint database is locked: {}", error_msg);
                match lock_holder_pid(&error_msg) {
                    Some(pid) if !is_process_running(pid) => {
                        tracing::warn!("Lock holder {} is gone, clearing stale lock", pid);
                        remove_stale_lock(path).map_err(|io_err| {
                            StorageError::Database(format!("Failed to remove lock files: {}", io_err))
                        })?;
                        let conn = Connection::open(path)?;
                        Ok(Self::from_connection(conn))
                    }
                    Some(pid) => {
                        tracing::error!("Process {} still holds the checkpoint database", pid);
                        Err(e.into())
                    }
                    None => Err(e.into()),
                }
            }
        }
    }

    /// In-memory store for tests
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|_| StorageError::Database("Connection lock poisoned".to_string()))
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Database(format!("Task join error: {}", e))
}

fn is_constraint_violation(e: &duckdb::Error) -> bool {
    let msg = e.to_string();
    msg.contains("Constraint Error") || msg.contains("Duplicate key")
}

fn decode_record(json: &str) -> Result<CheckpointRecord, StorageError> {
    Ok(serde_json::from_str(json)?)
}

#[async_trait]
impl CheckpointStore for DuckDbCheckpointStore {
    async fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS checkpoints (
                    stream_id VARCHAR NOT NULL,
                    batch_id UBIGINT NOT NULL,
                    version UINTEGER NOT NULL,
                    record_data TEXT NOT NULL,
                    committed_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (stream_id, batch_id)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS batch_plans (
                    stream_id VARCHAR NOT NULL,
                    batch_id UBIGINT NOT NULL,
                    plan_data TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (stream_id, batch_id)
                )",
                [],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn append_checkpoint(&self, record: &CheckpointRecord) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let stream_id = record.stream_id.clone();
        let batch_id = record.batch_id;
        let version = record.version;
        let committed_at = record.committed_at.timestamp_micros();
        let record_json = serde_json::to_string(record)?;

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            // Plain INSERT: an existing (stream_id, batch_id) is a conflict, never overwritten.
            let result = conn.execute(
                "INSERT INTO checkpoints (stream_id, batch_id, version, record_data, committed_at)
                 VALUES (?, ?, ?, ?, to_timestamp(? / 1000000.0))",
                duckdb::params![stream_id, batch_id, version, record_json, committed_at],
            );
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(StorageError::Conflict { stream_id, batch_id }),
                Err(e) => Err(e.into()),
            }
        })
        .await
        .map_err(join_error)?
    }

    async fn last_checkpoint(&self, stream_id: &str) -> Result<Option<CheckpointRecord>, StorageError> {
        let conn = self.conn.clone();
        let stream_id = stream_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT record_data FROM checkpoints
                 WHERE stream_id = ?
                 ORDER BY batch_id DESC
                 LIMIT 1",
            )?;
            let mut rows = stmt.query(duckdb::params![stream_id])?;

            if let Some(row) = rows.next()? {
                let json: String = row.get(0)?;
                Ok(Some(decode_record(&json)?))
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(join_error)?
    }

    async fn checkpoint_history(
        &self,
        stream_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>, StorageError> {
        let conn = self.conn.clone();
        let stream_id = stream_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT record_data FROM checkpoints
                 WHERE stream_id = ?
                 ORDER BY batch_id DESC
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(duckdb::params![stream_id, limit as i64], |row| {
                row.get::<_, String>(0)
            })?;

            let mut records = Vec::new();
            for json in rows {
                records.push(decode_record(&json?)?);
            }
            Ok(records)
        })
        .await
        .map_err(join_error)?
    }

    async fn save_plan(&self, plan: &BatchPlan) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let stream_id = plan.stream_id.clone();
        let batch_id = plan.batch_id;
        let plan_json = serde_json::to_string(plan)?;
        let now = Utc::now().timestamp_micros();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO batch_plans (stream_id, batch_id, plan_data, created_at)
                 VALUES (?, ?, ?, to_timestamp(? / 1000000.0))",
                duckdb::params![stream_id, batch_id, plan_json, now],
            )?;
            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn pending_plan(&self, stream_id: &str) -> Result<Option<BatchPlan>, StorageError> {
        let conn = self.conn.clone();
        let stream_id = stream_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT plan_data FROM batch_plans
                 WHERE stream_id = ?
                   AND batch_id > COALESCE(
                       (SELECT max(batch_id) FROM checkpoints WHERE stream_id = ?), 0)
                 ORDER BY batch_id
                 LIMIT 1",
            )?;
            let mut rows = stmt.query(duckdb::params![stream_id, stream_id])?;

            if let Some(row) = rows.next()? {
                let json: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&json)?))
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(join_error)?
    }

    async fn prune(&self, stream_id: &str, retain: usize) -> Result<usize, StorageError> {
        let conn = self.conn.clone();
        let stream_id = stream_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let removed = conn.execute(
                "DELETE FROM checkpoints
                 WHERE stream_id = ?
                   AND batch_id NOT IN (
                       SELECT batch_id FROM checkpoints
                       WHERE stream_id = ?
                       ORDER BY batch_id DESC
                       LIMIT ?)",
                duckdb::params![stream_id, stream_id, retain as i64],
            )?;

            conn.execute(
                "DELETE FROM batch_plans
                 WHERE stream_id = ?
                   AND batch_id <= COALESCE(
                       (SELECT max(batch_id) FROM checkpoints WHERE stream_id = ?), 0)",
                duckdb::params![stream_id, stream_id],
            )?;

            Ok(removed)
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::checkpoint::{BatchStats, CURRENT_VERSION};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(stream_id: &str, batch_id: u64) -> CheckpointRecord {
        CheckpointRecord {
            version: CURRENT_VERSION,
            stream_id: stream_id.to_string(),
            batch_id,
            offsets: BTreeMap::from([(0, batch_id * 10)]),
            watermark: Default::default(),
            dedup: Default::default(),
            windows: Default::default(),
            data_loss: Vec::new(),
            stats: BatchStats::default(),
            outputs: Vec::new(),
            config_fingerprint: "abc".to_string(),
            committed_at: Utc::now(),
        }
    }

    fn plan(stream_id: &str, batch_id: u64) -> BatchPlan {
        BatchPlan {
            stream_id: stream_id.to_string(),
            batch_id,
            start: BTreeMap::from([(0, 0)]),
            end: BTreeMap::from([(0, 5)]),
            data_loss: Vec::new(),
        }
    }

    async fn setup() -> DuckDbCheckpointStore {
        let store = DuckDbCheckpointStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_last_checkpoint_per_stream() {
        let store = setup().await;
        assert!(store.last_checkpoint("clicks").await.unwrap().is_none());

        store.append_checkpoint(&record("clicks", 1)).await.unwrap();
        store.append_checkpoint(&record("clicks", 2)).await.unwrap();
        store.append_checkpoint(&record("iot", 1)).await.unwrap();

        let last = store.last_checkpoint("clicks").await.unwrap().unwrap();
        assert_eq!(last.batch_id, 2);
        assert_eq!(last.offsets.get(&0), Some(&20));
        assert_eq!(store.last_checkpoint("iot").await.unwrap().unwrap().batch_id, 1);
    }

    #[tokio::test]
    async fn test_append_is_not_an_overwrite() {
        let store = setup().await;
        store.append_checkpoint(&record("clicks", 1)).await.unwrap();

        let err = store.append_checkpoint(&record("clicks", 1)).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { batch_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_history_and_prune() {
        let store = setup().await;
        for batch_id in 1..=5 {
            store.append_checkpoint(&record("clicks", batch_id)).await.unwrap();
        }

        let history = store.checkpoint_history("clicks", 3).await.unwrap();
        let ids: Vec<u64> = history.iter().map(|r| r.batch_id).collect();
        assert_eq!(ids, vec![5, 4, 3]);

        assert_eq!(store.prune("clicks", 2).await.unwrap(), 3);
        let ids: Vec<u64> = store
            .checkpoint_history("clicks", 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.batch_id)
            .collect();
        assert_eq!(ids, vec![5, 4]);
    }

    #[tokio::test]
    async fn test_pending_plan_only_above_last_commit() {
        let store = setup().await;
        store.save_plan(&plan("clicks", 1)).await.unwrap();
        assert_eq!(store.pending_plan("clicks").await.unwrap(), Some(plan("clicks", 1)));

        store.append_checkpoint(&record("clicks", 1)).await.unwrap();
        assert_eq!(store.pending_plan("clicks").await.unwrap(), None);

        store.save_plan(&plan("clicks", 2)).await.unwrap();
        store.prune("clicks", 10).await.unwrap();
        assert_eq!(store.pending_plan("clicks").await.unwrap().map(|p| p.batch_id), Some(2));
        assert_eq!(store.pending_plan("iot").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("checkpoints.duckdb");

        {
            let store = DuckDbCheckpointStore::new(&path).unwrap();
            store.init_schema().await.unwrap();
            store.append_checkpoint(&record("clicks", 1)).await.unwrap();
        }

        let store = DuckDbCheckpointStore::new(&path).unwrap();
        store.init_schema().await.unwrap();
        assert_eq!(store.last_checkpoint("clicks").await.unwrap().unwrap().batch_id, 1);
    }

    #[test]
    fn test_lock_holder_pid() {
        assert_eq!(
            lock_holder_pid("IO Error: Could not set lock on file: Conflicting lock is held in /bin/x (PID 4242) by user"),
            Some(4242)
        );
        assert_eq!(lock_holder_pid("no pid here"), None);
    }
}
