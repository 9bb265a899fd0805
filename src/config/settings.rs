//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Log levels accepted in `logging.level`.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Directories tools may read datasets from.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,

    /// Directory for cached results and the script library.
    #[serde(default)]
    pub cache_root: Option<PathBuf>,

    /// Never write to disk (cache lookups still happen).
    #[serde(default)]
    pub read_only: bool,

    /// External statistical runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Session engine settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// HTTP transport settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error listing every failed check, separated by `; `.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.runtime.command.as_os_str().is_empty() {
            problems.push("runtime.command cannot be empty".to_string());
        }
        if self.runtime.timeout_secs == 0 {
            problems.push("runtime.timeout_secs must be greater than zero".to_string());
        }
        if self.runtime.max_concurrent == 0 {
            problems.push("runtime.max_concurrent must be greater than zero".to_string());
        }
        if !self.http.path.starts_with('/') {
            problems.push(format!("http.path '{}' must start with '/'", self.http.path));
        }
        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            problems.push(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError {
                message: problems.join("; "),
            })
        }
    }
}

/// External runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Executable that runs a script file (default: `Rscript`).
    #[serde(default = "default_command")]
    pub command: PathBuf,

    /// Arguments placed before the script path.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Cap on captured bytes per output stream.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Maximum number of runtime processes alive at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl RuntimeConfig {
    /// Returns the per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_command() -> PathBuf {
    PathBuf::from("Rscript")
}

fn default_args() -> Vec<String> {
    vec!["--vanilla".to_string()]
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_output_bytes() -> usize {
    1024 * 1024
}

const fn default_max_concurrent() -> usize {
    4
}

/// Session engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Seconds in-flight calls may keep running after shutdown begins.
    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,
}

impl ServerConfig {
    /// Returns the drain grace period.
    #[must_use]
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            drain_grace_secs: default_drain_grace_secs(),
        }
    }
}

const fn default_drain_grace_secs() -> u64 {
    5
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Listen address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Endpoint path.
    #[serde(default = "default_http_path")]
    pub path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            path: default_http_path(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_http_path() -> String {
    "/mcp".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
