//! Configuration loading from disk or from a decoded config tree.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::endpoint::{ExtraConfig, NAMESPACE};
use crate::config::schema::ConfigData;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    /// The telemetry namespace is absent. Distinct from an empty section,
    /// which yields the defaults.
    #[error("no config found for opentelemetry")]
    NoConfig,
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ConfigError {
    /// True for the "nothing configured" sentinel.
    pub fn is_no_config(&self) -> bool {
        matches!(self, ConfigError::NoConfig)
    }
}

/// Load and validate configuration from a TOML or JSON file.
pub fn load_config(path: &Path) -> Result<ConfigData, ConfigError> {
    let content = fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => parse_toml(&content),
        Some("json") => parse_json(&content),
        other => Err(ConfigError::UnsupportedFormat(
            other.unwrap_or_default().to_string(),
        )),
    }
}

/// Parse and validate a TOML document.
pub fn parse_toml(content: &str) -> Result<ConfigData, ConfigError> {
    let config: ConfigData = toml::from_str(content)?;
    finalize(config)
}

/// Parse and validate a JSON document.
pub fn parse_json(content: &str) -> Result<ConfigData, ConfigError> {
    let config: ConfigData = serde_json::from_str(content)?;
    finalize(config)
}

/// Extract the telemetry section from a host's service-level `extra_config`.
pub fn from_extra_config(extra: &ExtraConfig) -> Result<ConfigData, ConfigError> {
    let section = extra.get(NAMESPACE).ok_or(ConfigError::NoConfig)?;
    let config: ConfigData = serde_json::from_value(section.clone())?;
    finalize(config)
}

fn finalize(mut config: ConfigData) -> Result<ConfigData, ConfigError> {
    validate_config(&config).map_err(ConfigError::Validation)?;
    config.apply_defaults();
    Ok(config)
}
