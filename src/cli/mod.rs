//! CLI module for Postpilot
//!
//! - `serve`: run the orchestrator and its HTTP/WebSocket surface (default)
//! - `check-config`: load and validate configuration, print the result

use crate::server::{self, AppConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Postpilot content pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "postpilot")]
#[command(about = "Content pipeline orchestrator")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Start the server (default)
    Serve,
    /// Load configuration and print the effective settings
    CheckConfig {
        /// Also write the effective configuration to this file
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

/// Run the CLI command with an already loaded configuration
pub async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => server::run(config).await,
        Commands::CheckConfig { write } => check_config(&config, write),
    }
}

fn check_config(config: &AppConfig, write: Option<PathBuf>) -> anyhow::Result<()> {
    // building the collaborators validates URLs and client settings
    config.content_services()?;
    let context = config.context_config();
    println!("{}", toml::to_string_pretty(config)?);
    println!(
        "# backend: {}, monitored services: {}",
        if context.redis_url.is_some() { "redis" } else { "memory" },
        context.monitored_services.len()
    );
    if let Some(path) = write {
        config.save(&path)?;
        println!("# written to {}", path.display());
    }
    Ok(())
}
