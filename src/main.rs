use clap::{Parser, Subcommand};
use std::path::PathBuf;
use streamlake::config::resolve_config_path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "streamlake")]
#[command(about = "Effectively-once micro-batch ingestion from a partitioned log into Parquet", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured stream until Ctrl+C
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the checkpoint audit log of a stream
    Checkpoints {
        stream: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a starter config file
    Init {
        #[arg(long)]
        stdout: bool,
    },
    /// Load and validate the config without running
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamlake=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            streamlake::cli::run::run(config_path).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                streamlake::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                streamlake::cli::config::validate(config_path)?;
            }
        },
        Some(Commands::Checkpoints { stream, limit }) => {
            streamlake::cli::checkpoints::show(config_path, &stream, limit).await?;
        }
    }

    Ok(())
}
