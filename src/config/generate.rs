pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# STREAMLAKE CONFIGURATION
# =============================================================================
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/streamlake/config.yml
#   3. /etc/streamlake/config.yml
#
# Paths may use ~ and $env{VAR} expansion.

# -----------------------------------------------------------------------------
# LOG: the partitioned append-only log events are read from
# -----------------------------------------------------------------------------
# Each topic is a directory under root; each partition is <n>.log holding one
# JSON entry per line: {"offset": 0, "key": "...", "payload": {...}}
log:
  type: file
  root: /var/lib/streamlake/log

# -----------------------------------------------------------------------------
# STREAMS: one independent micro-batch loop per entry
# -----------------------------------------------------------------------------
streams:
  clickstream:
    kind: clickstream
    topic: clickstream
    table: clickstream
    trigger:
      interval: 5s                    # Wall-clock period between batches
      max_records_per_partition: 10000
    watermark:
      lateness: 2m                    # watermark = max(event_time) - lateness
    dedup:
      retention: 0s                   # Extra slack below the watermark for dedup keys
    aggregation:
      table: clickstream_agg          # One row per (window, group) once finalized
      group_by: url
      window: 1m

  iot:
    kind: telemetry
    topic: iot
    table: telemetry
    trigger:
      interval: 5s
    watermark:
      lateness: 2m

# -----------------------------------------------------------------------------
# READER
# -----------------------------------------------------------------------------
reader:
  poll_timeout: 10s
  retry:
    max_attempts: 5
    initial_backoff: 200ms
    max_backoff: 30s
  on_parse_error: drop                # drop | fail
  on_data_loss: reset                 # reset (record gap, resume at earliest) | fail

# -----------------------------------------------------------------------------
# SINK: Parquet output, partitioned by table and event date
# -----------------------------------------------------------------------------
sink:
  root: /var/lib/streamlake/tables
  compression: zstd                   # uncompressed | snappy | zstd | gzip
  max_stage_attempts: 3

# -----------------------------------------------------------------------------
# CHECKPOINT: append-only commit log (DuckDB)
# -----------------------------------------------------------------------------
checkpoint:
  path: /var/lib/streamlake/checkpoints.duckdb
  retain: 1000                        # Committed records kept per stream

# -----------------------------------------------------------------------------
# WEB: status API
# -----------------------------------------------------------------------------
web:
  enabled: true
  listen: 127.0.0.1:7180
"#
    .to_string()
}
