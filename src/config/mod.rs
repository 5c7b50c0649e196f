//! Configuration module for the Warden gateway
//!
//! Supports YAML and TOML configuration formats with validation.
//! Environment variables can be interpolated using `${VAR}`, `${VAR:-default}`, or `${VAR:?error}` syntax.

mod env;
mod types;
mod validation;

pub use env::{expand_env_vars, resolve_secret, EnvExpander};
pub use types::*;
pub use validation::validate_config;

use crate::error::{GatewayError, Result};
use std::path::Path;
use tracing::info;

/// Load configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!("Failed to read config file {:?}: {}", path, e))
    })?;

    let content = expand_env_vars(&content)?;
    let config = parse_config(&content, path)?;
    validate_config(&config)?;

    info!(
        providers = config.providers.len(),
        "Configuration loaded successfully from {:?}", path
    );
    Ok(config)
}

/// Parse configuration from string content; the format follows the file extension
pub fn parse_config(content: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

    match extension {
        "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.into()),
        "toml" => toml::from_str(content).map_err(|e| e.into()),
        _ => Err(GatewayError::Config(format!(
            "Unsupported config format: {}",
            extension
        ))),
    }
}
