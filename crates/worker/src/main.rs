// Flownode worker
//
// Design Decision: Use clap derive with env fallbacks for every setting.
// Design Decision: Runs against the in-memory store; one process per run.

mod runner;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::runner::Runner;

#[derive(Parser, Debug)]
#[command(name = "flownode-worker")]
#[command(about = "Run process instances of a definition on a worker pool")]
#[command(version)]
pub struct Cli {
    /// Process definition (JSON)
    #[arg(long, short, env = "FLOWNODE_DEFINITION")]
    pub definition: PathBuf,

    /// Number of process instances to start
    #[arg(long, short, env = "FLOWNODE_INSTANCES", default_value_t = 1)]
    pub instances: usize,

    /// Number of concurrent workers
    #[arg(long, short, env = "FLOWNODE_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Signals to throw once the instances are idle
    #[arg(long, short, env = "FLOWNODE_SIGNALS", value_delimiter = ',')]
    pub signal: Vec<String>,

    /// Initial process data as a JSON object
    #[arg(long, env = "FLOWNODE_DATA")]
    pub data: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; LOG_LEVEL sets the level for the engine crates
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(format!(
            "flownode_worker={log_level},flownode_engine={log_level}"
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    tracing::info!(definition = %cli.definition.display(), "flownode-worker starting...");

    let runner = Runner::new(&cli)?;

    tokio::select! {
        result = runner.run(&cli) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "Worker error");
            }
            runner.shutdown().await?;
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            runner.shutdown().await?;
            tracing::info!("Worker shutdown complete");
            Ok(())
        }
    }
}
