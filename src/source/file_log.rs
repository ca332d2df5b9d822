use super::log::{LogEntry, LogError, PartitionedLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const TAIL_CHUNK: u64 = 4096;

/// On-disk form of one log line
#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    offset: u64,
    #[serde(default)]
    key: Option<String>,
    payload: serde_json::Value,
    #[serde(default)]
    append_time: Option<DateTime<Utc>>,
}

/// Directory-backed partitioned log.
///
/// Layout: `<root>/<topic>/<partition>.log`, one JSON entry per line with
/// contiguous offsets. Retention truncation records the new base offset in
/// `<partition>.base` so an emptied partition keeps its position.
///
/// Reads remember the byte position after the last entry returned, so a
/// consumer polling forward seeks straight to its next entry.
#[derive(Debug, Clone)]
pub struct FileLog {
    root: PathBuf,
    positions: Arc<Mutex<HashMap<(String, u32), (u64, u64)>>>,
}

impl FileLog {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            positions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn partition_path(&self, topic: &str, partition: u32) -> PathBuf {
        self.root.join(topic).join(format!("{}.log", partition))
    }

    fn base_path(&self, topic: &str, partition: u32) -> PathBuf {
        self.root.join(topic).join(format!("{}.base", partition))
    }

    /// Append a JSON payload and return its offset
    pub fn append(
        &self,
        topic: &str,
        partition: u32,
        key: Option<&str>,
        payload: serde_json::Value,
        append_time: Option<DateTime<Utc>>,
    ) -> Result<u64, LogError> {
        let path = self.partition_path(topic, partition);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (_, next) = self.bounds_blocking(topic, partition)?;
        let entry = FileEntry {
            offset: next,
            key: key.map(str::to_string),
            payload,
            append_time,
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| LogError::Corrupt(format!("failed to encode entry: {}", e)))?;

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(next)
    }

    /// Drop entries below `offset`, as broker retention would
    pub fn truncate_before(&self, topic: &str, partition: u32, offset: u64) -> Result<(), LogError> {
        let path = self.partition_path(topic, partition);
        let (_, next) = self.bounds_blocking(topic, partition)?;
        self.forget_position(topic, partition)?;

        let tmp = path.with_extension("log.tmp");
        if let Ok(source) = File::open(&path) {
            let mut out = File::create(&tmp)?;
            for line in BufReader::new(source).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                if parse_line(&line)?.offset >= offset {
                    writeln!(out, "{}", line)?;
                }
            }
            out.sync_all()?;
            std::fs::rename(&tmp, &path)?;
        }
        std::fs::write(self.base_path(topic, partition), offset.min(next).to_string())?;
        Ok(())
    }

    /// (earliest, next) offsets of a partition, from its first and last lines
    fn bounds_blocking(&self, topic: &str, partition: u32) -> Result<(u64, u64), LogError> {
        let path = self.partition_path(topic, partition);
        let base = match std::fs::read_to_string(self.base_path(topic, partition)) {
            Ok(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| LogError::Corrupt(format!("bad base offset: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let first = first_line(&path)?.map(|l| parse_line(&l)).transpose()?;
        let last = last_line(&path)?.map(|l| parse_line(&l)).transpose()?;
        match (first, last) {
            (Some(first), Some(last)) => Ok((first.offset, last.offset + 1)),
            _ => Ok((base, base)),
        }
    }

    fn cached_position(&self, topic: &str, partition: u32, offset: u64) -> Result<Option<u64>, LogError> {
        let positions = self.positions.lock().map_err(|_| poisoned())?;
        Ok(positions
            .get(&(topic.to_string(), partition))
            .filter(|(cached, _)| *cached == offset)
            .map(|(_, pos)| *pos))
    }

    fn remember_position(&self, topic: &str, partition: u32, offset: u64, pos: u64) -> Result<(), LogError> {
        let mut positions = self.positions.lock().map_err(|_| poisoned())?;
        positions.insert((topic.to_string(), partition), (offset, pos));
        Ok(())
    }

    fn forget_position(&self, topic: &str, partition: u32) -> Result<(), LogError> {
        let mut positions = self.positions.lock().map_err(|_| poisoned())?;
        positions.remove(&(topic.to_string(), partition));
        Ok(())
    }

    fn read_blocking(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        let path = self.partition_path(topic, partition);
        if !path.exists() && !self.root.join(topic).exists() {
            return Err(LogError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            });
        }

        let (earliest, next) = self.bounds_blocking(topic, partition)?;
        if from < earliest {
            return Err(LogError::OffsetOutOfRange {
                topic: topic.to_string(),
                partition,
                requested: from,
                earliest,
            });
        }
        if from >= next || max == 0 {
            return Ok(Vec::new());
        }

        let start = self.cached_position(topic, partition, from)?;
        let scan = match start {
            Some(pos) => match scan_entries(&path, pos, from, max)? {
                Some(scan) => scan,
                // The file changed under the cached position
                None => scan_from_start(topic, partition, &path, from, max)?,
            },
            None => scan_from_start(topic, partition, &path, from, max)?,
        };

        let (entries, end_pos) = scan;
        if let Some(last) = entries.last() {
            self.remember_position(topic, partition, last.offset + 1, end_pos)?;
        }
        Ok(entries)
    }
}

fn poisoned() -> LogError {
    LogError::Unavailable("read position cache lock poisoned".to_string())
}

fn scan_from_start(
    topic: &str,
    partition: u32,
    path: &Path,
    from: u64,
    max: usize,
) -> Result<(Vec<LogEntry>, u64), LogError> {
    scan_entries(path, 0, from, max)?.ok_or_else(|| {
        LogError::Corrupt(format!("{}/{}: offset {} not found", topic, partition, from))
    })
}

/// Read up to `max` contiguous entries from offset `from`, starting at byte `pos`.
///
/// Returns the entries with the byte position after the last one, or `None`
/// when a non-zero `pos` does not lead to entry `from`.
fn scan_entries(
    path: &Path,
    pos: u64,
    from: u64,
    max: usize,
) -> Result<Option<(Vec<LogEntry>, u64)>, LogError> {
    let start = pos;
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut reader = BufReader::new(file);

    let mut entries = Vec::new();
    let mut expected = from;
    let mut pos = start;
    let mut line = String::new();
    while entries.len() < max {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        pos += read as u64;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry = match parse_line(trimmed) {
            Ok(entry) => entry,
            Err(_) if entries.is_empty() && start > 0 => return Ok(None),
            Err(e) => return Err(e),
        };
        if entry.offset < from {
            continue;
        }
        if entry.offset != expected {
            if entries.is_empty() {
                return Ok(None);
            }
            return Err(LogError::Corrupt(format!(
                "{}: expected offset {}, found {}",
                path.display(),
                expected,
                entry.offset
            )));
        }
        let payload =
            serde_json::to_vec(&entry.payload).map_err(|e| LogError::Corrupt(e.to_string()))?;
        entries.push(LogEntry {
            offset: entry.offset,
            key: entry.key,
            payload,
            append_time: entry.append_time,
        });
        expected += 1;
    }
    Ok(Some((entries, pos)))
}

fn first_line(path: &Path) -> Result<Option<String>, LogError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

/// Last non-blank line, read backwards from the end of the file
fn last_line(path: &Path) -> Result<Option<String>, LogError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut pos = file.metadata()?.len();
    let mut tail: Vec<u8> = Vec::new();
    while pos > 0 {
        let step = TAIL_CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&tail);
        tail = chunk;

        let end = tail
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        if let Some(newline) = tail[..end].iter().rposition(|b| *b == b'\n') {
            return Ok(Some(String::from_utf8_lossy(&tail[newline + 1..end]).into_owned()));
        }
        if pos == 0 && end > 0 {
            return Ok(Some(String::from_utf8_lossy(&tail[..end]).into_owned()));
        }
    }
    Ok(None)
}

fn parse_line(line: &str) -> Result<FileEntry, LogError> {
    serde_json::from_str(line).map_err(|e| LogError::Corrupt(format!("{}: {}", e, line)))
}

#[async_trait]
impl PartitionedLog for FileLog {
    async fn partitions(&self, topic: &str) -> Result<Vec<u32>, LogError> {
        let dir = self.root.join(topic);
        tokio::task::spawn_blocking(move || {
            let mut partitions = Vec::new();
            let read_dir = match std::fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(partitions),
                Err(e) => return Err(e.into()),
            };
            for entry in read_dir {
                let name = entry?.file_name().to_string_lossy().to_string();
                if let Some(id) = name.strip_suffix(".log").and_then(|s| s.parse::<u32>().ok()) {
                    partitions.push(id);
                }
            }
            partitions.sort_unstable();
            Ok(partitions)
        })
        .await
        .map_err(|e| LogError::Unavailable(format!("task join error: {}", e)))?
    }

    async fn earliest_offset(&self, topic: &str, partition: u32) -> Result<u64, LogError> {
        let log = self.clone();
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || log.bounds_blocking(&topic, partition).map(|b| b.0))
            .await
            .map_err(|e| LogError::Unavailable(format!("task join error: {}", e)))?
    }

    async fn latest_offset(&self, topic: &str, partition: u32) -> Result<u64, LogError> {
        let log = self.clone();
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || log.bounds_blocking(&topic, partition).map(|b| b.1))
            .await
            .map_err(|e| LogError::Unavailable(format!("task join error: {}", e)))?
    }

    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        let log = self.clone();
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || log.read_blocking(&topic, partition, from, max))
            .await
            .map_err(|e| LogError::Unavailable(format!("task join error: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::new(dir.path());

        for i in 0..3 {
            let offset = log
                .append("clicks", 0, Some("u1"), json!({ "n": i }), None)
                .unwrap();
            assert_eq!(offset, i);
        }
        log.append("clicks", 2, None, json!({}), None).unwrap();

        assert_eq!(log.partitions("clicks").await.unwrap(), vec![0, 2]);
        let entries = log.read("clicks", 0, 1, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].offset, 1);
        assert_eq!(entries[0].key.as_deref(), Some("u1"));
        let value: serde_json::Value = serde_json::from_slice(&entries[0].payload).unwrap();
        assert_eq!(value, json!({ "n": 1 }));

        assert!(log.read("clicks", 0, 3, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncate_moves_earliest() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::new(dir.path());
        for _ in 0..5 {
            log.append("iot", 0, None, json!({}), None).unwrap();
        }
        log.truncate_before("iot", 0, 3).unwrap();

        assert_eq!(log.earliest_offset("iot", 0).await.unwrap(), 3);
        assert_eq!(log.latest_offset("iot", 0).await.unwrap(), 5);
        assert!(matches!(
            log.read("iot", 0, 0, 10).await,
            Err(LogError::OffsetOutOfRange { earliest: 3, .. })
        ));

        // Appends continue from the same position after retention.
        assert_eq!(log.append("iot", 0, None, json!({}), None).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_fully_truncated_partition_keeps_base() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::new(dir.path());
        for _ in 0..2 {
            log.append("iot", 0, None, json!({}), None).unwrap();
        }
        log.truncate_before("iot", 0, 2).unwrap();

        assert_eq!(log.earliest_offset("iot", 0).await.unwrap(), 2);
        assert_eq!(log.append("iot", 0, None, json!({}), None).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_forward_polling_across_appends() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::new(dir.path());
        for i in 0..4 {
            log.append("clicks", 0, None, json!({ "n": i }), None).unwrap();
        }

        let first = log.read("clicks", 0, 0, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        log.append("clicks", 0, None, json!({ "n": 4 }), None).unwrap();

        let second = log.read("clicks", 0, 3, 10).await.unwrap();
        let offsets: Vec<u64> = second.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![3, 4]);
        let value: serde_json::Value = serde_json::from_slice(&second[1].payload).unwrap();
        assert_eq!(value, json!({ "n": 4 }));

        // Re-reading an earlier offset ignores the remembered position
        let again = log.read("clicks", 0, 1, 1).await.unwrap();
        assert_eq!(again[0].offset, 1);
    }

    #[tokio::test]
    async fn test_truncation_by_another_handle() {
        let dir = TempDir::new().unwrap();
        let reader = FileLog::new(dir.path());
        let admin = FileLog::new(dir.path());
        for _ in 0..6 {
            admin.append("iot", 0, None, json!({}), None).unwrap();
        }

        assert_eq!(reader.read("iot", 0, 0, 2).await.unwrap().len(), 2);
        admin.truncate_before("iot", 0, 1).unwrap();

        let entries = reader.read("iot", 0, 2, 10).await.unwrap();
        let offsets: Vec<u64> = entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_bounds_with_long_last_line() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::new(dir.path());
        log.append("clicks", 0, None, json!({}), None).unwrap();
        let big = "x".repeat(3 * TAIL_CHUNK as usize);
        log.append("clicks", 0, None, json!({ "blob": big }), None).unwrap();

        assert_eq!(log.earliest_offset("clicks", 0).await.unwrap(), 0);
        assert_eq!(log.latest_offset("clicks", 0).await.unwrap(), 2);
    }
}
