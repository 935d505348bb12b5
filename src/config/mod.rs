pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::{AppConfig, LogConfig, Mode, ProtocolConfig};

pub fn load_config(path: &str) -> Result<AppConfig> {
    let content = std::fs::read_to_string(Path::new(path)).with_context(|| format!("read config {}", path))?;
    let config = parse_config(&content)?;
    tracing::debug!(path, mode = ?config.mode, "config loaded");
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = serde_yml::from_str(content).context("parse config yaml")?;
    config.validate()?;
    Ok(config)
}
