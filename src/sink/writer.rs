use super::rows::SinkRow;
use crate::config::types::{Compression, SinkConfig};
use chrono::NaiveDate;
use duckdb::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

const STAGED_SUFFIX: &str = ".staged";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("Task join error: {0}")]
    Join(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("DuckDB extension '{0}' is not linked into this build")]
    ExtensionUnavailable(String),
}

/// A Parquet file written under its staging name and not yet visible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub table: String,
    pub date: NaiveDate,
    pub batch_id: u64,
    pub rows: usize,
    pub staged_path: PathBuf,
    pub final_path: PathBuf,
}

/// A committed output file, as listed in the checkpoint manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedFile {
    pub table: String,
    pub date: NaiveDate,
    pub rows: usize,
    pub path: PathBuf,
    pub sha256: String,
}

/// Writes batch output as date-partitioned Parquet.
///
/// Files are staged as `<root>/<table>/dt=<date>/.part-<batch>.parquet.staged`
/// and renamed into place on commit. The final name depends only on the
/// batch id, so a replayed batch overwrites its own output.
pub struct SinkWriter {
    root: PathBuf,
    compression: Compression,
    conn: Arc<Mutex<Connection>>,
    staged: HashMap<u64, Vec<StagedFile>>,
}

impl SinkWriter {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        Self::with_root(&config.root, config.compression)
    }

    pub fn with_root<P: AsRef<Path>>(root: P, compression: Compression) -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory()?;
        // A single writer thread keeps row groups and bytes reproducible.
        conn.execute_batch(
            "SET threads TO 1;
             SET preserve_insertion_order = true;
             SET autoinstall_known_extensions = false;
             SET autoload_known_extensions = false;",
        )?;
        // Parquet must be statically linked; nothing is downloaded at runtime.
        let parquet_loaded: bool = conn.query_row(
            "SELECT count(*) > 0 FROM duckdb_extensions() WHERE extension_name = 'parquet' AND loaded",
            [],
            |row| row.get(0),
        )?;
        if !parquet_loaded {
            return Err(SinkError::ExtensionUnavailable("parquet".to_string()));
        }
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            compression,
            conn: Arc::new(Mutex::new(conn)),
            staged: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn final_path(&self, table: &str, date: NaiveDate, batch_id: u64) -> PathBuf {
        self.partition_dir(table, date)
            .join(format!("part-{:020}.parquet", batch_id))
    }

    fn partition_dir(&self, table: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(table)
            .join(format!("dt={}", date.format("%Y-%m-%d")))
    }

    /// Write `rows` for `table` under staging names, one file per date partition.
    ///
    /// Staging the same batch and table again replaces the earlier staged files.
    pub async fn stage<R: SinkRow>(
        &mut self,
        batch_id: u64,
        table: &str,
        rows: Vec<R>,
    ) -> Result<Vec<StagedFile>, SinkError> {
        let mut by_date: BTreeMap<NaiveDate, Vec<R>> = BTreeMap::new();
        for row in rows {
            by_date.entry(row.partition_date()).or_default().push(row);
        }

        if let Some(pending) = self.staged.get_mut(&batch_id) {
            pending.retain(|f| f.table != table);
        }

        let mut written = Vec::with_capacity(by_date.len());
        for (date, rows) in by_date {
            let dir = self.partition_dir(table, date);
            let staged_path = dir.join(format!(".part-{:020}.parquet{}", batch_id, STAGED_SUFFIX));
            let final_path = self.final_path(table, date, batch_id);
            let count = rows.len();

            let conn = self.conn.clone();
            let compression = self.compression;
            let target = staged_path.clone();
            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&dir)?;
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
                let conn = conn.lock().map_err(|_| SinkError::LockPoisoned)?;
                write_parquet(&conn, &target, compression, &rows)
            })
            .await
            .map_err(|e| SinkError::Join(e.to_string()))??;

            tracing::debug!(
                table = table,
                date = %date,
                batch_id = batch_id,
                rows = count,
                "Staged parquet file"
            );

            let file = StagedFile {
                table: table.to_string(),
                date,
                batch_id,
                rows: count,
                staged_path,
                final_path,
            };
            // Tracked per file so a later failure still lets discard() find it
            self.staged.entry(batch_id).or_default().push(file.clone());
            written.push(file);
        }

        Ok(written)
    }

    /// Publish every staged file of a batch by renaming it to its final name
    pub async fn commit(&mut self, batch_id: u64) -> Result<Vec<PublishedFile>, SinkError> {
        let Some(files) = self.staged.remove(&batch_id) else {
            return Ok(Vec::new());
        };

        let published = tokio::task::spawn_blocking(move || {
            let mut published = Vec::with_capacity(files.len());
            for file in files {
                let sha256 = file_sha256(&file.staged_path)?;
                std::fs::rename(&file.staged_path, &file.final_path)?;
                published.push(PublishedFile {
                    table: file.table,
                    date: file.date,
                    rows: file.rows,
                    path: file.final_path,
                    sha256,
                });
            }
            Ok::<_, SinkError>(published)
        })
        .await
        .map_err(|e| SinkError::Join(e.to_string()))??;

        tracing::debug!(batch_id = batch_id, files = published.len(), "Published batch output");
        Ok(published)
    }

    /// Delete the staged files of a batch without publishing them
    pub fn discard(&mut self, batch_id: u64) -> Result<usize, SinkError> {
        let Some(files) = self.staged.remove(&batch_id) else {
            return Ok(0);
        };
        let mut removed = 0;
        for file in files {
            match std::fs::remove_file(&file.staged_path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// Remove leftover staged files under `tables`, e.g. after a crash
    pub fn purge_staged<T: AsRef<str>>(&mut self, tables: &[T]) -> Result<usize, SinkError> {
        self.staged.clear();
        let mut removed = 0;
        for table in tables {
            for path in self.table_files(table.as_ref())? {
                let is_staged = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(STAGED_SUFFIX));
                if is_staged {
                    std::fs::remove_file(&path)?;
                    tracing::info!("Removed orphaned staged file: {}", path.display());
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Delete files an earlier attempt of `batch_id` published under `tables`
    pub fn remove_published<T: AsRef<str>>(
        &mut self,
        batch_id: u64,
        tables: &[T],
    ) -> Result<usize, SinkError> {
        let name = format!("part-{:020}.parquet", batch_id);
        let mut removed = 0;
        for table in tables {
            for path in self.table_files(table.as_ref())? {
                if path.file_name().is_some_and(|n| n == name.as_str()) {
                    std::fs::remove_file(&path)?;
                    tracing::info!(batch_id = batch_id, "Removed output of abandoned attempt: {}", path.display());
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Published parquet files of a table, sorted by path
    pub fn published_files(&self, table: &str) -> Result<Vec<PathBuf>, SinkError> {
        let mut files: Vec<PathBuf> = self
            .table_files(table)?
            .into_iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == "parquet"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Every file inside the date partitions of a table
    fn table_files(&self, table: &str) -> Result<Vec<PathBuf>, SinkError> {
        let table_dir = self.root.join(table);
        let mut files = Vec::new();
        if !table_dir.is_dir() {
            return Ok(files);
        }
        for partition in std::fs::read_dir(&table_dir)? {
            let partition = partition?.path();
            if !partition.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&partition)? {
                files.push(entry?.path());
            }
        }
        Ok(files)
    }
}

fn write_parquet<R: SinkRow>(
    conn: &Connection,
    target: &Path,
    compression: Compression,
    rows: &[R],
) -> Result<(), SinkError> {
    conn.execute_batch(&format!(
        "CREATE OR REPLACE TEMP TABLE stage_rows ({})",
        R::COLUMNS
    ))?;

    {
        let mut stmt = conn.prepare(&format!(
            "INSERT INTO stage_rows VALUES ({})",
            R::VALUES
        ))?;
        for row in rows {
            row.insert(&mut stmt)?;
        }
    }

    let path = target.to_string_lossy().replace('\'', "''");
    conn.execute_batch(&format!(
        "COPY (SELECT * FROM stage_rows ORDER BY {}) TO '{}' (FORMAT PARQUET, COMPRESSION {})",
        R::ORDER_BY,
        path,
        compression.as_sql()
    ))?;
    conn.execute_batch("DROP TABLE stage_rows")?;
    Ok(())
}

fn file_sha256(path: &Path) -> Result<String, SinkError> {
    let bytes = std::fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}
