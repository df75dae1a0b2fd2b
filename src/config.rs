//! Configuration module for the sockecho server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::framing::{FramePolicy, Framing, ReadMode};

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "sockecho")]
#[command(author = "sockecho authors")]
#[command(version = "0.1.0")]
#[command(about = "A UNIX socket echo backend for testing HTTP-like clients", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// UNIX domain socket path to listen on
    #[arg(short = 's', long)]
    pub socket: Option<PathBuf>,

    /// Maximum number of pending connections
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Connection dispatch mode
    #[arg(short = 'd', long, value_enum)]
    pub dispatch: Option<Dispatch>,

    /// Maximum in-flight connections (concurrent dispatch only)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Bytes requested per read
    #[arg(long)]
    pub read_size: Option<usize>,

    /// How a request frame is read
    #[arg(long, value_enum)]
    pub read_mode: Option<ReadMode>,

    /// Largest frame buffered in until-separator mode
    #[arg(long)]
    pub max_frame: Option<usize>,

    /// What to do with a frame that has no header/body separator
    #[arg(long, value_enum)]
    pub policy: Option<FramePolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// How accepted connections are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Dispatch {
    /// One connection is fully handled before the next accept.
    #[default]
    Sequential,
    /// Each connection runs on its own task.
    Concurrent,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Socket path to bind
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub dispatch: Dispatch,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            backlog: default_backlog(),
            dispatch: Dispatch::default(),
            max_connections: default_max_connections(),
        }
    }
}

/// Request framing configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    #[serde(default = "default_read_size")]
    pub read_size: usize,
    #[serde(default)]
    pub read_mode: ReadMode,
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,
    #[serde(default)]
    pub policy: FramePolicy,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            read_size: default_read_size(),
            read_mode: ReadMode::default(),
            max_frame: default_max_frame(),
            policy: FramePolicy::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_socket() -> PathBuf {
    PathBuf::from("server.socket")
}

fn default_backlog() -> i32 {
    10
}

fn default_max_connections() -> usize {
    1024
}

fn default_read_size() -> usize {
    4096
}

fn default_max_frame() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub socket: PathBuf,
    pub backlog: i32,
    pub dispatch: Dispatch,
    pub max_connections: usize,
    pub framing: Framing,
    pub log_level: String,
}

impl Config {
    /// Default configuration listening on `socket`.
    pub fn for_socket(socket: impl AsRef<Path>) -> Self {
        let server = ServerConfig::default();
        let framing = FramingConfig::default();
        Config {
            socket: socket.as_ref().to_path_buf(),
            backlog: server.backlog,
            dispatch: server.dispatch,
            max_connections: server.max_connections,
            framing: Framing {
                read_size: framing.read_size,
                read_mode: framing.read_mode,
                max_frame: framing.max_frame,
                policy: framing.policy,
            },
            log_level: default_log_level(),
        }
    }

    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            socket: cli.socket.unwrap_or(toml_config.server.socket),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            dispatch: cli.dispatch.unwrap_or(toml_config.server.dispatch),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            framing: Framing {
                read_size: cli.read_size.unwrap_or(toml_config.framing.read_size),
                read_mode: cli.read_mode.unwrap_or(toml_config.framing.read_mode),
                max_frame: cli.max_frame.unwrap_or(toml_config.framing.max_frame),
                policy: cli.policy.unwrap_or(toml_config.framing.policy),
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the listener cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog < 1 {
            return Err(ConfigError::Invalid("backlog must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.framing.read_size == 0 {
            return Err(ConfigError::Invalid("read_size must be at least 1"));
        }
        if self.framing.max_frame < self.framing.read_size {
            return Err(ConfigError::Invalid("max_frame must not be smaller than read_size"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
