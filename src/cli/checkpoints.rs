use crate::config::load_config;
use crate::storage::{CheckpointStore, CheckpointSummary, DuckDbCheckpointStore};
use std::path::PathBuf;

/// Print the checkpoint audit log of one stream as JSON, newest first
pub async fn show(
    config_path: Option<PathBuf>,
    stream: &str,
    limit: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;
    let config = load_config(&path)?;
    if !config.streams.contains_key(stream) {
        return Err(format!("Unknown stream '{}'", stream).into());
    }

    let store = DuckDbCheckpointStore::new(&config.checkpoint.path)?;
    store.init_schema().await?;

    let records = store.checkpoint_history(stream, limit).await?;
    let summaries: Vec<CheckpointSummary> = records.iter().map(CheckpointSummary::from).collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);

    if let Some(plan) = store.pending_plan(stream).await? {
        eprintln!(
            "Batch {} is planned but not committed; it will be replayed on the next run",
            plan.batch_id
        );
    }
    Ok(())
}
