//! Snare Daemon - supervised decoy network services
//!
//! Keeps each decoy converged on the desired state written by `snarectl`.

use anyhow::Result;
use clap::Parser;
use snare_common::Config;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "snared")]
#[command(about = "Snare - supervised decoy network services", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (defaults to /etc/snare/config.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("[BOOT] Snare Daemon v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::load(args.config.as_deref());
    info!("[BOOT] Config loaded");

    let shutdown = CancellationToken::new();
    tokio::spawn(snared::daemon::cancel_on_signal(
        tokio::signal::ctrl_c(),
        shutdown.clone(),
    ));

    snared::daemon::run(config, shutdown).await?;
    info!("[SHUTDOWN] Shutting down gracefully");
    Ok(())
}
