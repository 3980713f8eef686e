//! CLI - Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Snare control CLI
#[derive(Parser)]
#[command(name = "snarectl")]
#[command(about = "Snare - turn decoy services on and off", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Configuration file (defaults to /etc/snare/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// State file (overrides the configured one)
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Show desired and actual state of every decoy
    Status {
        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Ask the daemon to run a decoy
    Start {
        /// shell, dns, ftp, smb or web
        decoy: String,
    },

    /// Ask the daemon to stop a decoy
    Stop {
        /// shell, dns, ftp, smb or web
        decoy: String,
    },

    /// Show recent activity for a decoy
    Logs {
        decoy: String,

        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },

    /// Write a default configuration file
    InitConfig {
        /// Destination (defaults to /etc/snare/config.toml)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
