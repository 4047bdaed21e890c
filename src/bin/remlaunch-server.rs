//! Distribution server host.
//!
//! Synchronizes every connecting launcher client against the base
//! directory and optionally starts the game once a sync succeeds.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use remlaunch::{NullHandler, RunParameters, Server, ServerConfig, SyncOutcome};

#[derive(Debug, Parser)]
#[command(name = "remlaunch-server", version, about = "Remote launcher distribution server")]
struct Args {
    /// Directory holding the authoritative game data
    #[arg(long, env = "REMLAUNCH_BASE_DIR")]
    base_dir: PathBuf,

    /// Address to listen on, "host" or "host:port" (default port 3413)
    #[arg(long, env = "REMLAUNCH_LISTEN", default_value = "0.0.0.0")]
    listen: String,

    /// Cap on files with an outstanding write request
    #[arg(long, env = "REMLAUNCH_MAX_IN_PROGRESS_FILES", default_value_t = 1)]
    max_in_progress_files: u32,

    /// Cap on blocks in flight across all files
    #[arg(long, env = "REMLAUNCH_MAX_IN_PROGRESS_BLOCKS", default_value_t = 2)]
    max_in_progress_blocks: u32,

    /// Uniform block size for diffing, in bytes
    #[arg(long, env = "REMLAUNCH_BLOCK_SIZE", default_value_t = 1_024_000)]
    block_size: u32,

    /// Worker threads per connected client
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Profile to start on the client after a successful sync
    #[arg(long)]
    profile: Option<String>,

    /// Game configuration blob passed with the start request
    #[arg(long, default_value = "")]
    game_config: String,

    /// Arguments passed with the start request
    #[arg(long, default_value = "")]
    run_arguments: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = ServerConfig::new(&args.base_dir, &args.listen);
    config.max_in_progress_files = args.max_in_progress_files;
    config.max_in_progress_blocks = args.max_in_progress_blocks;
    config.block_size = args.block_size;
    config.worker_count = args.workers;

    let server = Server::bind(config, Arc::new(NullHandler))
        .await
        .context("failed to start server")?;

    loop {
        tokio::select! {
            accepted = server.accept() => {
                let client = accepted.context("accept failed")?;
                let params = args.profile.clone().map(|profile| {
                    RunParameters::new(&args.game_config, profile, &args.run_arguments)
                });
                tokio::spawn(async move {
                    match client.synchronize().await {
                        Ok(SyncOutcome::Success) => {
                            info!(client = client.name(), "synchronized");
                            if let Some(params) = params {
                                if let Err(e) = client.start_application(&params) {
                                    error!(client = client.name(), error = %e,
                                        "failed to start application");
                                }
                            }
                        }
                        Ok(SyncOutcome::Failure(message)) => {
                            error!(client = client.name(), %message, "synchronization failed");
                        }
                        Err(e) => {
                            error!(client = client.name(), error = %e,
                                "could not start synchronization");
                        }
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
