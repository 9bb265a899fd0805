//! Server configuration.
//!
//! One JSON file configures the runtime command, file access, the result
//! cache, draining, the HTTP listener and logging. Every field has a default,
//! so the file (and any section of it) may be omitted.
//!
//! The file is read from the path given on the command line, or else from
//! `~/.rstats-mcp/config.json` (`%USERPROFILE%\.rstats-mcp\config.json` on
//! Windows). No file at the default location means built-in defaults; no
//! file at an explicit path is an error.
//!
//! `config/example-config.json` documents every field.

mod settings;

pub use settings::{
    Config, HttpConfig, LoggingConfig, RuntimeConfig, ServerConfig, LOG_LEVELS,
};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.rstats-mcp/`
/// - **Windows:** `%USERPROFILE%\.rstats-mcp\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".rstats-mcp"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads and validates the configuration.
///
/// # Errors
///
/// Returns an error if an explicit `path` does not exist, or if the file
/// cannot be read, is not valid JSON, or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) if path.exists() => read_config(path),
        Some(path) => Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        }),
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => read_config(&path),
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Config::default())
            }
        },
    }
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;

    let config: Config =
        serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;

    config.validate()?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}
