use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log: LogConfig,
    pub streams: BTreeMap<String, StreamConfig>,
    #[serde(default)]
    pub reader: ReaderConfig,
    pub sink: SinkConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub kind: StreamKind,
    pub topic: String,
    /// Output table for raw (deduplicated) events
    pub table: String,
    #[serde(default)]
    pub trigger: TriggerConfig,
    pub watermark: WatermarkConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    pub aggregation: Option<AggregationConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Clickstream,
    Telemetry,
}

impl StreamKind {
    /// String fields an aggregation may group by
    pub fn groupable_fields(&self) -> &'static [&'static str] {
        match self {
            StreamKind::Clickstream => &["url", "user_id", "referrer", "user_agent", "session_id"],
            StreamKind::Telemetry => &["device_id", "site"],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(with = "humantime_serde", default = "default_trigger_interval")]
    pub interval: Duration,
    #[serde(default = "default_max_records")]
    pub max_records_per_partition: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            interval: default_trigger_interval(),
            max_records_per_partition: default_max_records(),
        }
    }
}

fn default_trigger_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_records() -> usize {
    10000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    #[serde(with = "humantime_serde")]
    pub lateness: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Extra slack below the watermark during which keys are remembered
    #[serde(with = "humantime_serde", default)]
    pub retention: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub table: String,
    pub group_by: String,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    #[serde(with = "humantime_serde", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_parse_error_strategy")]
    pub on_parse_error: ParseErrorStrategy,
    #[serde(default = "default_data_loss_strategy")]
    pub on_data_loss: DataLossStrategy,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_timeout: default_poll_timeout(),
            retry: RetryConfig::default(),
            on_parse_error: default_parse_error_strategy(),
            on_data_loss: default_data_loss_strategy(),
        }
    }
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_parse_error_strategy() -> ParseErrorStrategy {
    ParseErrorStrategy::Drop
}

fn default_data_loss_strategy() -> DataLossStrategy {
    DataLossStrategy::Reset
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseErrorStrategy {
    Drop,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataLossStrategy {
    /// Acknowledge the gap, record it, and resume from the earliest offset
    Reset,
    /// Halt the stream loop
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub root: PathBuf,
    #[serde(default = "default_compression")]
    pub compression: Compression,
    #[serde(default = "default_max_stage_attempts")]
    pub max_stage_attempts: usize,
}

fn default_compression() -> Compression {
    Compression::Zstd
}

fn default_max_stage_attempts() -> usize {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Uncompressed,
    Snappy,
    Zstd,
    Gzip,
}

impl Compression {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Compression::Uncompressed => "UNCOMPRESSED",
            Compression::Snappy => "SNAPPY",
            Compression::Zstd => "ZSTD",
            Compression::Gzip => "GZIP",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    /// Number of committed records kept per stream for audit
    #[serde(default = "default_retain")]
    pub retain: usize,
}

fn default_retain() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7180".to_string()
}
