//! Postpilot - content pipeline orchestrator
//!
//! CLI entry point for the Postpilot server.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

mod api;
mod cli;
mod middleware;
mod server;
mod websocket;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = cli::Cli::parse();
    let config = server::load_config().context("Failed to load configuration")?;

    // dropping the guard flushes buffered file logs
    let _log_guard = server::init_logging(&config.logging)?;
    debug!(?cli, "Configuration loaded");

    cli::run(cli, config).await
}
