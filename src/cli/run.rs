use crate::config::parse::load_config;
use crate::config::types::{Config, LogType};
use crate::pipeline::{build_runners, run_streams, MetricsRegistry};
use crate::source::{FileLog, PartitionedLog};
use crate::storage::{CheckpointStore, DuckDbCheckpointStore};
use crate::web::{run_server, AppState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("web server error: {0}")]
    WebServer(String),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/streamlake/config.yml");
            eprintln!("  /etc/streamlake/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'streamlake config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_pipeline(&config_path).await.map_err(|e| e.into())
}

fn open_log(config: &Config) -> Arc<dyn PartitionedLog> {
    match config.log.log_type {
        LogType::File => Arc::new(FileLog::new(&config.log.root)),
    }
}

async fn run_pipeline(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    info!(path = %config.checkpoint.path.display(), "Opening checkpoint store");
    let store = DuckDbCheckpointStore::new(&config.checkpoint.path)?;
    store.init_schema().await?;
    let store: Arc<dyn CheckpointStore> = Arc::new(store);

    let log = open_log(&config);
    let runners = build_runners(&config, log, store.clone())?;
    let metrics: MetricsRegistry = runners
        .iter()
        .map(|runner| (runner.stream_id().to_string(), runner.metrics()))
        .collect();
    info!(streams = runners.len(), sink = %config.sink.root.display(), "Streams configured");

    let shutdown = CancellationToken::new();

    let web_handle = if config.web.enabled {
        let state = AppState {
            metrics: Arc::new(metrics),
            store: store.clone(),
        };
        let web_config = config.web.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            run_server(state, web_config, token)
                .await
                .map_err(|e| RunError::WebServer(e.to_string()))
        }))
    } else {
        None
    };

    let pipeline = tokio::spawn(run_streams(runners, shutdown.clone()));
    info!("Pipeline started, press Ctrl+C to shutdown");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, finishing in-flight batches");
            signal_token.cancel();
        }
    });

    let result = match pipeline.await {
        Ok(result) => result.map_err(RunError::from),
        Err(e) => Err(RunError::Pipeline(crate::pipeline::PipelineError::Task {
            stream: "*".to_string(),
            reason: e.to_string(),
        })),
    };

    // All streams have stopped; take the status API down with them.
    shutdown.cancel();
    if let Some(handle) = web_handle {
        match handle.await {
            Ok(Ok(())) => info!("Status API stopped"),
            Ok(Err(e)) => error!(error = %e, "Status API error"),
            Err(e) => error!(error = %e, "Status API join error"),
        }
    }

    info!("Pipeline shutdown complete");
    result
}
