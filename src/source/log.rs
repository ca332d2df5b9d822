use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("offset {requested} out of range for {topic}/{partition} (earliest available: {earliest})")]
    OffsetOutOfRange {
        topic: String,
        partition: u32,
        requested: u64,
        earliest: u64,
    },

    #[error("unknown partition {topic}/{partition}")]
    UnknownPartition { topic: String, partition: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt log entry: {0}")]
    Corrupt(String),
}

impl LogError {
    /// Whether a retry of the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, LogError::Io(_) | LogError::Unavailable(_))
    }
}

/// One record of a partition as stored by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub append_time: Option<DateTime<Utc>>,
}

/// Boundary to the partitioned, offset-addressable log.
///
/// Reads within a partition are strictly ordered, and re-reading from an
/// offset returned earlier yields identical entries.
#[async_trait]
pub trait PartitionedLog: Send + Sync {
    async fn partitions(&self, topic: &str) -> Result<Vec<u32>, LogError>;

    async fn earliest_offset(&self, topic: &str, partition: u32) -> Result<u64, LogError>;

    /// Offset the next appended entry will receive
    async fn latest_offset(&self, topic: &str, partition: u32) -> Result<u64, LogError>;

    /// Read up to `max` entries starting at `from`.
    ///
    /// Returns an empty vec when `from` is at or past the end, and
    /// `OffsetOutOfRange` when `from` is below the earliest retained offset.
    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<LogEntry>, LogError>;
}

#[derive(Debug, Default)]
struct MemoryPartition {
    base_offset: u64,
    entries: VecDeque<LogEntry>,
}

impl MemoryPartition {
    fn next_offset(&self) -> u64 {
        self.base_offset + self.entries.len() as u64
    }
}

/// In-process log used by tests and local experiments
#[derive(Debug, Default)]
pub struct MemoryLog {
    topics: Mutex<HashMap<String, BTreeMap<u32, MemoryPartition>>>,
    failing_reads: AtomicUsize,
    failing_partitions: Mutex<HashMap<u32, usize>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut topics = self.topics.lock().unwrap();
        let entry = topics.entry(topic.to_string()).or_default();
        for partition in 0..partitions {
            entry.entry(partition).or_default();
        }
    }

    /// Append a payload and return its offset
    pub fn append(
        &self,
        topic: &str,
        partition: u32,
        key: Option<&str>,
        payload: &[u8],
        append_time: Option<DateTime<Utc>>,
    ) -> u64 {
        let mut topics = self.topics.lock().unwrap();
        let data = topics
            .entry(topic.to_string())
            .or_default()
            .entry(partition)
            .or_default();
        let offset = data.next_offset();
        data.entries.push_back(LogEntry {
            offset,
            key: key.map(str::to_string),
            payload: payload.to_vec(),
            append_time,
        });
        offset
    }

    /// Drop every entry below `offset`, as broker retention would
    pub fn truncate_before(&self, topic: &str, partition: u32, offset: u64) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(data) = topics.get_mut(topic).and_then(|t| t.get_mut(&partition)) {
            while data.base_offset < offset && !data.entries.is_empty() {
                data.entries.pop_front();
                data.base_offset += 1;
            }
            if data.entries.is_empty() && data.base_offset < offset {
                data.base_offset = offset;
            }
        }
    }

    /// Make the next `count` reads fail with a transient error
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` reads of one partition fail with a transient error
    pub fn fail_partition_reads(&self, partition: u32, count: usize) {
        self.failing_partitions.lock().unwrap().insert(partition, count);
    }

    fn take_partition_failure(&self, partition: u32) -> bool {
        let mut failing = self.failing_partitions.lock().unwrap();
        match failing.get_mut(&partition) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn with_partition<T>(
        &self,
        topic: &str,
        partition: u32,
        f: impl FnOnce(&MemoryPartition) -> T,
    ) -> Result<T, LogError> {
        let topics = self.topics.lock().unwrap();
        topics
            .get(topic)
            .and_then(|t| t.get(&partition))
            .map(f)
            .ok_or_else(|| LogError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }
}

#[async_trait]
impl PartitionedLog for MemoryLog {
    async fn partitions(&self, topic: &str) -> Result<Vec<u32>, LogError> {
        let topics = self.topics.lock().unwrap();
        Ok(topics
            .get(topic)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn earliest_offset(&self, topic: &str, partition: u32) -> Result<u64, LogError> {
        self.with_partition(topic, partition, |p| p.base_offset)
    }

    async fn latest_offset(&self, topic: &str, partition: u32) -> Result<u64, LogError> {
        self.with_partition(topic, partition, |p| p.next_offset())
    }

    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        let pending_failures = self.failing_reads.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_reads.store(pending_failures - 1, Ordering::SeqCst);
            return Err(LogError::Unavailable("injected read failure".to_string()));
        }
        if self.take_partition_failure(partition) {
            return Err(LogError::Unavailable(format!(
                "injected read failure on partition {}",
                partition
            )));
        }

        self.with_partition(topic, partition, |p| {
            if from < p.base_offset {
                return Err(LogError::OffsetOutOfRange {
                    topic: topic.to_string(),
                    partition,
                    requested: from,
                    earliest: p.base_offset,
                });
            }
            let skip = (from - p.base_offset) as usize;
            Ok(p.entries.iter().skip(skip).take(max).cloned().collect())
        })?
    }
}
