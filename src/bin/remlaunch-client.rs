//! Launcher client host.
//!
//! Connects to a distribution server, keeps the local data directory
//! synchronized and launches the configured game on request.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use remlaunch::{ClientConfig, CommandRunner, GameRunner, LauncherClient, NullRunner};

#[derive(Debug, Parser)]
#[command(name = "remlaunch-client", version, about = "Remote launcher client")]
struct Args {
    /// Directory the server's data tree is synchronized into
    #[arg(long, env = "REMLAUNCH_BASE_DIR")]
    base_dir: PathBuf,

    /// Server address, "host" or "host:port" (default port 3413)
    #[arg(long, env = "REMLAUNCH_CONNECT")]
    connect: String,

    /// Name identifying this client to the server
    #[arg(long, env = "REMLAUNCH_CLIENT_NAME", default_value = "remlaunch-client")]
    name: String,

    /// Worker threads draining the task queue
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Game executable launched on start-application requests. Without it
    /// start requests are acknowledged but launch nothing.
    #[arg(long, env = "REMLAUNCH_GAME_COMMAND")]
    game_command: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = ClientConfig::new(&args.base_dir, &args.name, &args.connect);
    config.worker_count = args.workers;

    let runner: Box<dyn GameRunner> = match args.game_command {
        Some(program) => Box::new(CommandRunner::new(program)),
        None => Box::new(NullRunner::new()),
    };

    let client = LauncherClient::connect(config, runner)
        .await
        .context("failed to connect")?;

    tokio::select! {
        _ = client.wait_closed() => {
            info!("server closed the connection");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            client.disconnect();
        }
    }
    Ok(())
}
