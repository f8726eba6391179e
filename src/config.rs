//! Server configuration.
//!
//! Three runtime tunables (`port`, `max_connections`, `thread_count`)
//! resolve from built-in defaults, then an optional `key=value` config file,
//! then positional command-line overrides. Buffer sizing and the memory
//! ceiling are compile-time constants.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Largest frame guaranteed deliverable.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Hard cap on the per-connection read accumulator. A peer that buffers this
/// much without a delimiter is disconnected.
pub const READ_ACCUMULATOR_LIMIT: usize = 10 * MAX_MESSAGE_SIZE;

/// Capacity class of outbound pool buffers and the per-connection scratch.
pub const MESSAGE_BUFFER_SIZE: usize = 4096;

/// Maximum buffers the shared outbound pool will hand out at once.
pub const OUTBOUND_POOL_MAX: usize = 1024;

/// Buffers pre-populated into a pool at construction to amortize first use.
pub const POOL_PREALLOC: usize = 10;

/// Ceiling for process-wide pooled-buffer memory.
pub const MAX_TOTAL_MEMORY: usize = 100 * 1024 * 1024;

/// Readiness events drained per poll call.
pub const EVENT_BATCH_SIZE: usize = 100;

/// Readiness-wait timeout; bounds how long a stop request can go unnoticed.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-read chunk size while draining a socket.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Default idle cutoff for the inactive-connection sweep.
pub const INACTIVITY_TIMEOUT_SECS: u64 = 300;

/// Period of the reactor's maintenance tick.
pub const CLEANUP_INTERVAL_SECS: u64 = 30;

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "linewire")]
#[command(version = "0.1.0")]
#[command(about = "Newline-framed TCP message server", long_about = None)]
pub struct CliArgs {
    /// Path to a key=value configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Listen port
    pub port: Option<u16>,

    /// Maximum concurrent client connections
    pub max_connections: Option<usize>,

    /// Worker threads executing connection steps
    pub thread_count: Option<usize>,
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_connections: usize,
    pub thread_count: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            max_connections: 1000,
            thread_count: 4,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from CLI arguments and the optional config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Resolve defaults, then the config file, then CLI overrides.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            config.apply_file(&contents)?;
        }

        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(max_connections) = cli.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(thread_count) = cli.thread_count {
            config.thread_count = thread_count;
        }
        config.log_level = cli.log_level;

        if config.thread_count == 0 {
            return Err(ConfigError::InvalidValue("thread_count", "0".to_string()));
        }
        if config.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections", "0".to_string()));
        }

        Ok(config)
    }

    /// Apply `key=value` lines. `#` starts a comment, unknown keys are
    /// ignored, malformed lines are skipped.
    fn apply_file(&mut self, contents: &str) -> Result<(), ConfigError> {
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "port" => self.port = parse_value("port", value)?,
                "max_connections" => {
                    self.max_connections = parse_value("max_connections", value)?;
                }
                "thread_count" => self.thread_count = parse_value("thread_count", value)?,
                _ => {}
            }
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key, value.to_string()))
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(key, value) => {
                write!(f, "Invalid value for '{key}': '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
