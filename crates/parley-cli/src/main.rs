//! Parley CLI - host for the Parley attachment transfer engine
//!
//! Inspects configuration and transfer history, and runs in-process
//! transfers for trying the engine out.
//!
//! ## Quick Start
//!
//! ```bash
//! # Send a file to three local downloaders
//! parley loopback ./video.mp4 --downloaders 3
//!
//! # Review what was transferred
//! parley history
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Loopback(args) => commands::loopback::run(args).await,
        Command::Config(args) => commands::config::run(args).await,
        Command::History(args) => commands::history::run(args).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,parley=info,parley_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
