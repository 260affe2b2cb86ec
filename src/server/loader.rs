//! Configuration loading
//!
//! Handles loading configuration from embedded defaults, files, and environment.

use super::config::AppConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Environment variable selecting `config/{name}.toml`
pub const ENV_SELECTOR: &str = "POSTPILOT_ENV";

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig> {
    let env_name = std::env::var(ENV_SELECTOR).unwrap_or_else(|_| "development".to_string());
    load_config_from(&["config/default", &format!("config/{}", env_name), "config/local"])
}

/// Layer the embedded defaults, the optional files in `files` order, then
/// `POSTPILOT_<SECTION>__<KEY>` environment variables.
pub fn load_config_from(files: &[&str]) -> Result<AppConfig> {
    let mut builder = Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));
    for name in files {
        builder = builder.add_source(File::with_name(name).required(false));
    }

    // prefix_separator("_") keeps POSTPILOT_SERVER__PORT working; config 0.14
    // would otherwise expect POSTPILOT__SERVER__PORT.
    let config = builder
        .add_source(
            Environment::with_prefix("POSTPILOT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}
