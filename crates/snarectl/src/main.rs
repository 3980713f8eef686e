//! Snare Control - operator CLI for the Snare daemon
//!
//! Records intent in the shared state file; the daemon does the rest.

use clap::Parser;
use snarectl::cli::Cli;
use snarectl::output;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = snarectl::commands::run(cli) {
        output::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
