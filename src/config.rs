//! Configuration for the tcp-core binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::stress::StressStart;
use crate::runtime::DEFAULT_RECV_BUFFER_SIZE;
use crate::transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_RECEIVE_DIR};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// What the binary does once the runtime is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Chat echo, stress receiver and file receiver on one listener
    Server,
    /// Chat client sending one greeting per session
    Client,
    /// Send one file and exit when it completes
    SendFile,
    /// Load-test client
    Stress,
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tcp-core")]
#[command(version)]
#[command(about = "Asynchronous TCP session engine with chunked file transfer", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (server) or connect to (clients)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Operating mode
    #[arg(long, value_enum, default_value_t = Mode::Server)]
    pub mode: Mode,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum concurrent sessions accepted by the server
    #[arg(short = 'm', long)]
    pub max_sessions: Option<usize>,

    /// Sessions opened by client modes
    #[arg(short = 's', long)]
    pub sessions: Option<usize>,

    /// File to send in send-file mode
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Greeting sent by the chat client
    #[arg(long)]
    pub message: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub stress: StressConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub workers: Option<usize>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_sessions: default_max_sessions(),
        }
    }
}

/// Client-mode configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_sessions")]
    pub sessions: usize,
    #[serde(default = "default_message")]
    pub message: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sessions: default_client_sessions(),
            message: default_message(),
        }
    }
}

/// Per-session settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Nominal bytes per read; each session reserves ten times this
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: default_recv_buffer_size(),
        }
    }
}

/// File transfer settings
#[derive(Debug, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_receive_dir")]
    pub receive_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            receive_dir: default_receive_dir(),
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

/// Stress-mode settings
#[derive(Debug, Deserialize)]
pub struct StressConfig {
    #[serde(default = "default_stress_count")]
    pub message_count: u32,
    #[serde(default = "default_stress_size")]
    pub message_size: u32,
    #[serde(default)]
    pub interval_ms: u32,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            message_count: default_stress_count(),
            message_size: default_stress_size(),
            interval_ms: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_listen() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_max_sessions() -> usize {
    1000
}

fn default_client_sessions() -> usize {
    1
}

fn default_message() -> String {
    "Hello from client!".to_string()
}

fn default_recv_buffer_size() -> usize {
    DEFAULT_RECV_BUFFER_SIZE
}

fn default_receive_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RECEIVE_DIR)
}

fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_delay_ms() -> u64 {
    10
}

fn default_stress_count() -> u32 {
    1000
}

fn default_stress_size() -> u32 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub address: SocketAddr,
    pub workers: Option<usize>,
    pub max_sessions: usize,
    pub client_sessions: usize,
    pub recv_buffer_size: usize,
    pub receive_dir: PathBuf,
    pub chunk_size: u32,
    pub chunk_delay: Duration,
    pub file: Option<PathBuf>,
    pub message: String,
    pub stress: StressStart,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let address = resolve(&listen)?;

        if cli.mode == Mode::SendFile && cli.file.is_none() {
            return Err(ConfigError::MissingFile);
        }

        Ok(Config {
            mode: cli.mode,
            address,
            workers: cli.workers.or(toml_config.server.workers),
            max_sessions: cli
                .max_sessions
                .unwrap_or(toml_config.server.max_sessions),
            client_sessions: cli.sessions.unwrap_or(toml_config.client.sessions),
            recv_buffer_size: toml_config.session.recv_buffer_size,
            receive_dir: toml_config.transfer.receive_dir,
            chunk_size: toml_config.transfer.chunk_size,
            chunk_delay: Duration::from_millis(toml_config.transfer.chunk_delay_ms),
            file: cli.file,
            message: cli.message.unwrap_or(toml_config.client.message),
            stress: StressStart {
                message_count: toml_config.stress.message_count,
                message_size: toml_config.stress.message_size,
                interval_ms: toml_config.stress.interval_ms,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

fn resolve(listen: &str) -> Result<SocketAddr, ConfigError> {
    listen
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidAddress(listen.to_string()))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("send-file mode requires --file")]
    MissingFile,
}
