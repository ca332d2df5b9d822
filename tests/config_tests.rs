use std::fs;
use streamlake::config::types::{Compression, DataLossStrategy, ParseErrorStrategy};
use streamlake::config::{generate::generate_starter_config, load_config, ConfigError};
use tempfile::TempDir;

fn write_config(dir: &TempDir, yaml: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.yml");
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_generated_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, &generate_starter_config());

    let config = load_config(&config_path).expect("Generated config should be valid");

    assert_eq!(config.streams.len(), 2);
    assert!(config.streams.contains_key("clickstream"));
    assert!(config.streams.contains_key("iot"));
    assert_eq!(config.sink.compression, Compression::Zstd);
    assert_eq!(config.reader.on_parse_error, ParseErrorStrategy::Drop);
    assert_eq!(config.reader.on_data_loss, DataLossStrategy::Reset);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
log:
  type: file
  root: /tmp/log
streams:
  clicks:
    kind: clickstream
    topic: clicks
    table: clickstream
    watermark:
      lateness: 5s
sink:
  root: /tmp/tables
checkpoint:
  path: /tmp/checkpoints.duckdb
"#,
    );

    let config = load_config(&config_path).unwrap();
    let stream = &config.streams["clicks"];
    assert_eq!(stream.trigger.interval.as_secs(), 5);
    assert_eq!(stream.trigger.max_records_per_partition, 10000);
    assert!(stream.dedup.retention.is_zero());
    assert!(stream.aggregation.is_none());
    assert_eq!(config.reader.retry.max_attempts, 5);
    assert_eq!(config.sink.max_stage_attempts, 3);
    assert_eq!(config.checkpoint.retain, 1000);
    assert!(!config.web.enabled);
}

#[test]
fn test_validation_collects_every_problem() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
log:
  type: file
  root: /tmp/log
streams:
  clicks:
    kind: clickstream
    topic: shared
    table: Clicks
    trigger:
      interval: 0s
    watermark:
      lateness: 5s
    aggregation:
      table: clicks_agg
      group_by: temp_c
      window: 1m
  iot:
    kind: telemetry
    topic: shared
    table: clicks_agg
    watermark:
      lateness: 5s
sink:
  root: /tmp/tables
  max_stage_attempts: 0
checkpoint:
  path: /tmp/checkpoints.duckdb
"#,
    );

    match load_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            let joined = errors.join("\n");
            assert!(joined.contains("table name 'Clicks'"), "{}", joined);
            assert!(joined.contains("cannot group by 'temp_c'"), "{}", joined);
            assert!(joined.contains("trigger.interval"), "{}", joined);
            assert!(joined.contains("topic 'shared'"), "{}", joined);
            assert!(joined.contains("table 'clicks_agg'"), "{}", joined);
            assert!(joined.contains("sink.max_stage_attempts"), "{}", joined);
        }
        other => panic!("expected validation errors, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_env_var_expansion() {
    std::env::set_var("STREAMLAKE_TEST_SINK_ROOT", "/data/lake");
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
log:
  type: file
  root: /tmp/log
streams:
  clicks:
    kind: clickstream
    topic: clicks
    table: clickstream
    watermark:
      lateness: 5s
sink:
  root: $env{STREAMLAKE_TEST_SINK_ROOT}
checkpoint:
  path: /tmp/checkpoints.duckdb
"#,
    );

    let config = load_config(&config_path).unwrap();
    assert_eq!(config.sink.root, std::path::PathBuf::from("/data/lake"));
}

#[test]
fn test_unset_env_var_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
log:
  type: file
  root: $env{STREAMLAKE_TEST_DEFINITELY_UNSET}
streams: {}
sink:
  root: /tmp/tables
checkpoint:
  path: /tmp/checkpoints.duckdb
"#,
    );

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("STREAMLAKE_TEST_DEFINITELY_UNSET"));
}

#[test]
fn test_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let err = load_config(&temp_dir.path().join("missing.yml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
