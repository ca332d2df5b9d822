use crate::config::types::{ParseErrorStrategy, ReaderConfig, StreamConfig, StreamKind};
use crate::retry::Backoff;
use crate::source::event::{DecodeError, Event};
use crate::source::log::{LogEntry, LogError, PartitionedLog};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("data loss detected on partition {partition}: offset {requested} expired, earliest available is {earliest}")]
    DataLossDetected {
        partition: u32,
        requested: u64,
        earliest: u64,
    },

    #[error("undecodable record at partition {partition} offset {offset}: {source}")]
    Decode {
        partition: u32,
        offset: u64,
        #[source]
        source: DecodeError,
    },
}

/// A decoded record together with its position in the log
#[derive(Debug, Clone, PartialEq)]
pub struct PolledRecord {
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub append_time: Option<DateTime<Utc>>,
    pub event: Event,
}

/// Result of one poll of a single partition
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    /// Decoded records in offset order
    pub records: Vec<PolledRecord>,
    /// Offset after the last entry read, including dropped ones
    pub next_offset: u64,
    /// Entries skipped because their payload could not be decoded
    pub malformed: u64,
}

/// A range of offsets that expired before it could be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLossGap {
    pub partition: u32,
    pub from: u64,
    pub to: u64,
    pub detected_at: DateTime<Utc>,
}

/// Cursor over every partition of one topic
pub struct PartitionReader {
    topic: String,
    kind: StreamKind,
    log: Arc<dyn PartitionedLog>,
    cursors: BTreeMap<u32, u64>,
    // partition -> (requested offset, earliest available) awaiting acknowledgement
    pending_loss: BTreeMap<u32, (u64, u64)>,
    poll_timeout: Duration,
    backoff: Backoff,
    parse_error_strategy: ParseErrorStrategy,
}

impl PartitionReader {
    pub fn new(stream: &StreamConfig, reader: &ReaderConfig, log: Arc<dyn PartitionedLog>) -> Self {
        Self {
            topic: stream.topic.clone(),
            kind: stream.kind,
            log,
            cursors: BTreeMap::new(),
            pending_loss: BTreeMap::new(),
            poll_timeout: reader.poll_timeout,
            backoff: Backoff::from(&reader.retry),
            parse_error_strategy: reader.on_parse_error,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current cursor positions (next offset to read per partition)
    pub fn cursors(&self) -> &BTreeMap<u32, u64> {
        &self.cursors
    }

    /// Replace cursor positions, e.g. from a recovered checkpoint
    pub fn restore(&mut self, offsets: &BTreeMap<u32, u64>) {
        self.cursors = offsets.clone();
        self.pending_loss.clear();
    }

    pub fn seek(&mut self, partition: u32, offset: u64) {
        self.cursors.insert(partition, offset);
    }

    /// Pick up partitions without a cursor, starting them at the earliest offset
    pub async fn discover(&mut self) -> Result<Vec<u32>, ReaderError> {
        let partitions = self
            .backoff
            .retry(
                "list partitions",
                || self.log.partitions(&self.topic),
                LogError::is_transient,
            )
            .await?;

        let mut added = Vec::new();
        for partition in partitions {
            if self.cursors.contains_key(&partition) {
                continue;
            }
            let earliest = self
                .backoff
                .retry(
                    "earliest offset",
                    || self.log.earliest_offset(&self.topic, partition),
                    LogError::is_transient,
                )
                .await?;
            tracing::info!(
                topic = %self.topic,
                partition = partition,
                offset = earliest,
                "Discovered partition"
            );
            self.cursors.insert(partition, earliest);
            added.push(partition);
        }
        Ok(added)
    }

    /// Read up to `max_records` entries of `partition` starting at `from_offset`.
    ///
    /// Does not move the cursor. An empty result means no new data.
    pub async fn poll(
        &mut self,
        partition: u32,
        from_offset: u64,
        max_records: usize,
    ) -> Result<PollResult, ReaderError> {
        let entries = match self.fetch(partition, from_offset, max_records).await {
            Ok(entries) => entries,
            Err(LogError::OffsetOutOfRange {
                requested, earliest, ..
            }) => {
                self.pending_loss.insert(partition, (requested, earliest));
                return Err(ReaderError::DataLossDetected {
                    partition,
                    requested,
                    earliest,
                });
            }
            Err(e) => return Err(e.into()),
        };

        self.decode(partition, from_offset, entries)
    }

    /// Poll from the partition's cursor and advance it past what was read
    pub async fn poll_next(
        &mut self,
        partition: u32,
        max_records: usize,
    ) -> Result<PollResult, ReaderError> {
        let from = self.cursors.get(&partition).copied().unwrap_or(0);
        let result = self.poll(partition, from, max_records).await?;
        self.cursors.insert(partition, result.next_offset);
        Ok(result)
    }

    /// Read exactly `[start, end)` of a partition, used to replay a recorded batch
    pub async fn read_range(
        &mut self,
        partition: u32,
        start: u64,
        end: u64,
    ) -> Result<PollResult, ReaderError> {
        let mut combined = PollResult {
            next_offset: start,
            ..Default::default()
        };

        while combined.next_offset < end {
            let remaining = (end - combined.next_offset) as usize;
            let polled = self.poll(partition, combined.next_offset, remaining).await?;
            if polled.next_offset == combined.next_offset {
                return Err(ReaderError::Log(LogError::Corrupt(format!(
                    "{}/{}: log ends at {} but batch plan expects {}",
                    self.topic, partition, combined.next_offset, end
                ))));
            }
            combined.records.extend(polled.records);
            combined.malformed += polled.malformed;
            combined.next_offset = polled.next_offset;
        }

        self.cursors.insert(partition, end);
        Ok(combined)
    }

    /// Accept a detected data loss and move the cursor to the earliest offset.
    ///
    /// Returns the skipped range, or `None` if nothing was pending.
    pub fn acknowledge_data_loss(&mut self, partition: u32) -> Option<DataLossGap> {
        let (requested, earliest) = self.pending_loss.remove(&partition)?;
        self.cursors.insert(partition, earliest);
        tracing::warn!(
            topic = %self.topic,
            partition = partition,
            from = requested,
            to = earliest,
            "Data loss acknowledged, cursor reset to earliest available offset"
        );
        Some(DataLossGap {
            partition,
            from: requested,
            to: earliest,
            detected_at: Utc::now(),
        })
    }

    async fn fetch(
        &self,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        let timeout = self.poll_timeout;
        self.backoff
            .retry(
                "log read",
                || async move {
                    match tokio::time::timeout(
                        timeout,
                        self.log.read(&self.topic, partition, from, max),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(LogError::Unavailable(format!(
                            "poll timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    }
                },
                LogError::is_transient,
            )
            .await
    }

    fn decode(
        &self,
        partition: u32,
        from_offset: u64,
        entries: Vec<LogEntry>,
    ) -> Result<PollResult, ReaderError> {
        let mut result = PollResult {
            records: Vec::with_capacity(entries.len()),
            next_offset: from_offset,
            malformed: 0,
        };

        for entry in entries {
            result.next_offset = entry.offset + 1;
            match Event::decode(self.kind, &entry.payload) {
                Ok(event) => result.records.push(PolledRecord {
                    partition,
                    offset: entry.offset,
                    key: entry.key,
                    append_time: entry.append_time,
                    event,
                }),
                Err(e) => match self.parse_error_strategy {
                    ParseErrorStrategy::Drop => {
                        tracing::debug!(
                            topic = %self.topic,
                            partition = partition,
                            offset = entry.offset,
                            error = %e,
                            "Dropping undecodable record"
                        );
                        result.malformed += 1;
                    }
                    ParseErrorStrategy::Fail => {
                        return Err(ReaderError::Decode {
                            partition,
                            offset: entry.offset,
                            source: e,
                        });
                    }
                },
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::*;
    use crate::source::log::MemoryLog;

    fn stream_config() -> StreamConfig {
        StreamConfig {
            kind: StreamKind::Clickstream,
            topic: "clickstream".to_string(),
            table: "clickstream".to_string(),
            trigger: TriggerConfig::default(),
            watermark: WatermarkConfig {
                lateness: Duration::from_secs(5),
            },
            dedup: DedupConfig::default(),
            aggregation: None,
        }
    }

    fn reader_config(strategy: ParseErrorStrategy) -> ReaderConfig {
        ReaderConfig {
            poll_timeout: Duration::from_secs(1),
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            on_parse_error: strategy,
            on_data_loss: DataLossStrategy::Reset,
        }
    }

    fn click(id: &str) -> Vec<u8> {
        format!(
            r#"{{"event_id":"{}","user_id":"u1","url":"/home","ts":"2025-01-01T00:00:00Z"}}"#,
            id
        )
        .into_bytes()
    }

    fn setup(strategy: ParseErrorStrategy) -> (Arc<MemoryLog>, PartitionReader) {
        let log = Arc::new(MemoryLog::new());
        log.create_topic("clickstream", 2);
        let reader = PartitionReader::new(
            &stream_config(),
            &reader_config(strategy),
            log.clone() as Arc<dyn PartitionedLog>,
        );
        (log, reader)
    }

    #[tokio::test]
    async fn test_poll_returns_ordered_offsets() {
        let (log, mut reader) = setup(ParseErrorStrategy::Drop);
        for id in ["a", "b", "c"] {
            log.append("clickstream", 0, None, &click(id), None);
        }
        reader.discover().await.unwrap();

        let first = reader.poll_next(0, 2).await.unwrap();
        let offsets: Vec<u64> = first.records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1]);
        assert_eq!(reader.cursors()[&0], 2);

        let second = reader.poll_next(0, 10).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].event.dedup_key(), "c");

        let empty = reader.poll_next(0, 10).await.unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.next_offset, 3);
    }

    #[tokio::test]
    async fn test_malformed_records_dropped_but_offsets_advance() {
        let (log, mut reader) = setup(ParseErrorStrategy::Drop);
        log.append("clickstream", 0, None, b"not json", None);
        log.append("clickstream", 0, None, &click("a"), None);
        reader.discover().await.unwrap();

        let result = reader.poll_next(0, 10).await.unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.malformed, 1);
        assert_eq!(result.next_offset, 2);
    }

    #[tokio::test]
    async fn test_malformed_record_fails_when_configured() {
        let (log, mut reader) = setup(ParseErrorStrategy::Fail);
        log.append("clickstream", 0, None, b"{}", None);
        reader.discover().await.unwrap();

        assert!(matches!(
            reader.poll_next(0, 10).await,
            Err(ReaderError::Decode { offset: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (log, mut reader) = setup(ParseErrorStrategy::Drop);
        log.append("clickstream", 1, None, &click("a"), None);
        reader.discover().await.unwrap();
        log.fail_next_reads(2);

        let result = reader.poll_next(1, 10).await.unwrap();
        assert_eq!(result.records.len(), 1);
    }

    #[tokio::test]
    async fn test_data_loss_requires_acknowledgement() {
        let (log, mut reader) = setup(ParseErrorStrategy::Drop);
        for id in ["a", "b", "c", "d"] {
            log.append("clickstream", 0, None, &click(id), None);
        }
        reader.discover().await.unwrap();
        log.truncate_before("clickstream", 0, 2);

        let err = reader.poll_next(0, 10).await.unwrap_err();
        assert!(matches!(
            err,
            ReaderError::DataLossDetected {
                partition: 0,
                requested: 0,
                earliest: 2
            }
        ));
        // Cursor is not moved until the loss is acknowledged.
        assert_eq!(reader.cursors()[&0], 0);
        assert!(reader.poll_next(0, 10).await.is_err());

        let gap = reader.acknowledge_data_loss(0).unwrap();
        assert_eq!((gap.from, gap.to), (0, 2));
        assert_eq!(reader.cursors()[&0], 2);

        let result = reader.poll_next(0, 10).await.unwrap();
        assert_eq!(result.records.len(), 2);
        assert!(reader.acknowledge_data_loss(0).is_none());
    }

    #[tokio::test]
    async fn test_read_range_is_exact() {
        let (log, mut reader) = setup(ParseErrorStrategy::Drop);
        for id in ["a", "b", "c", "d", "e"] {
            log.append("clickstream", 1, None, &click(id), None);
        }
        reader.discover().await.unwrap();

        let result = reader.read_range(1, 1, 4).await.unwrap();
        let keys: Vec<String> = result.records.iter().map(|r| r.event.dedup_key()).collect();
        assert_eq!(keys, vec!["b", "c", "d"]);
        assert_eq!(reader.cursors()[&1], 4);
    }
}
