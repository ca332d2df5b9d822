use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml)
}

/// Parse, expand and validate a config held in memory
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config: Config = serde_yaml::from_str(&yaml)?;
    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    let names = unexpanded_env_vars(yaml);
    if names.is_empty() {
        return Ok(());
    }

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}",
        names.join(", ")
    )))
}

fn expand_paths(config: &mut Config) {
    config.log.root = expand_tilde(&config.log.root);
    config.sink.root = expand_tilde(&config.sink.root);
    config.checkpoint.path = expand_tilde(&config.checkpoint.path);
}

/// Range and consistency checks. Every problem is collected before returning.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    let table_name = Regex::new(r"^[a-z_][a-z0-9_]*$").expect("table name pattern is valid");

    if config.streams.is_empty() {
        errors.push("at least one stream must be configured".to_string());
    }

    let mut tables = HashSet::new();
    let mut topics = HashSet::new();

    for (stream_id, stream) in &config.streams {
        if stream.topic.is_empty() {
            errors.push(format!("stream '{}': topic must not be empty", stream_id));
        } else if !topics.insert(stream.topic.clone()) {
            errors.push(format!(
                "stream '{}': topic '{}' is consumed by more than one stream",
                stream_id, stream.topic
            ));
        }

        let mut stream_tables = vec![stream.table.as_str()];
        if let Some(agg) = &stream.aggregation {
            stream_tables.push(agg.table.as_str());
        }
        for table in stream_tables {
            if !table_name.is_match(table) {
                errors.push(format!(
                    "stream '{}': table name '{}' must match [a-z_][a-z0-9_]*",
                    stream_id, table
                ));
            } else if !tables.insert(table.to_string()) {
                errors.push(format!(
                    "stream '{}': table '{}' is written by more than one producer",
                    stream_id, table
                ));
            }
        }

        if stream.trigger.interval.is_zero() {
            errors.push(format!("stream '{}': trigger.interval must be > 0", stream_id));
        }
        if stream.trigger.max_records_per_partition == 0 {
            errors.push(format!(
                "stream '{}': trigger.max_records_per_partition must be > 0",
                stream_id
            ));
        }

        if let Some(agg) = &stream.aggregation {
            if agg.window.as_millis() == 0 {
                errors.push(format!(
                    "stream '{}': aggregation.window must be at least 1ms",
                    stream_id
                ));
            }
            if !stream.kind.groupable_fields().contains(&agg.group_by.as_str()) {
                errors.push(format!(
                    "stream '{}': cannot group by '{}', expected one of: {}",
                    stream_id,
                    agg.group_by,
                    stream.kind.groupable_fields().join(", ")
                ));
            }
        }
    }

    if config.reader.retry.max_attempts == 0 {
        errors.push("reader.retry.max_attempts must be > 0".to_string());
    }
    if config.reader.poll_timeout.is_zero() {
        errors.push("reader.poll_timeout must be > 0".to_string());
    }
    if config.sink.max_stage_attempts == 0 {
        errors.push("sink.max_stage_attempts must be > 0".to_string());
    }
    if config.checkpoint.retain == 0 {
        errors.push("checkpoint.retain must be > 0".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}
