//! CLI command definitions and handlers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, it falls back to defaults.
pub fn load_config() -> parley_core::config::Config {
    parley_core::config::Config::load().unwrap_or_default()
}

pub mod config;
pub mod history;
pub mod loopback;

/// Parley - peer-to-peer attachment transfers for encrypted chat
#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Transfer a file between in-process peers
    Loopback(LoopbackArgs),

    /// View and modify configuration
    Config(ConfigArgs),

    /// View transfer history
    History(HistoryArgs),
}

/// Arguments for the loopback command
#[derive(Parser)]
pub struct LoopbackArgs {
    /// File to send
    pub file: PathBuf,

    /// Number of peers downloading the file at once
    #[arg(short, long, default_value = "1")]
    pub downloaders: usize,

    /// Output directory (defaults to the configured download directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Give up after this long (e.g., 30s, 5m)
    #[arg(short, long, default_value = "5m")]
    pub timeout: String,

    /// Record the downloads in the transfer history
    #[arg(long)]
    pub record: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,

        /// Value to set
        value: String,
    },

    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}

/// Arguments for the history command
#[derive(Parser)]
pub struct HistoryArgs {
    /// Show details for a specific transfer
    #[arg(long)]
    pub details: Option<usize>,

    /// Remove a transfer by request id
    #[arg(long)]
    pub remove: Option<String>,

    /// Mark downloads whose files are gone
    #[arg(long)]
    pub refresh: bool,

    /// Drop downloads whose files are gone
    #[arg(long)]
    pub prune: bool,

    /// Clear history
    #[arg(long)]
    pub clear: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
