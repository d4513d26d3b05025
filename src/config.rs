//! Configuration module for the stream-perf server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::stream::{StreamSettings, DEFAULT_IDEAL_SEND_BUFFER, DEFAULT_IO_SIZE};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the perf server
#[derive(Parser, Debug)]
#[command(name = "stream-perf")]
#[command(version = "0.1.0")]
#[command(about = "Throughput/latency benchmarking server for QUIC and multiplexed TCP streams", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind both backends to (e.g., [::]:4433)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Transport backends to serve
    #[arg(short = 'b', long, value_enum)]
    pub backend: Option<Backend>,

    /// Number of TCP worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum concurrent connections per backend
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Time allowed for in-flight responses to finish on shutdown
    #[arg(long)]
    pub drain_timeout_ms: Option<u64>,

    /// UDP port where any datagram stops the server
    #[arg(long)]
    pub teardown_port: Option<u16>,

    /// Largest chunk submitted in one send, in bytes
    #[arg(long)]
    pub io_size: Option<u32>,

    /// Bytes allowed in flight per stream
    #[arg(long)]
    pub send_buffer: Option<u64>,

    /// Keep exactly one send outstanding per stream
    #[arg(long)]
    pub buffered_io: bool,

    /// Number of send buffer descriptors per pool
    #[arg(long)]
    pub send_buffer_pool: Option<usize>,

    /// Maximum number of live streams across all connections
    #[arg(long)]
    pub stream_pool: Option<usize>,

    /// PEM certificate chain (self-signed if omitted)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// QUIC execution profile
    #[arg(long, value_enum)]
    pub execution_profile: Option<ExecutionProfile>,

    /// QUIC congestion control algorithm
    #[arg(long, value_enum)]
    pub congestion_control: Option<CongestionControl>,

    /// QUIC connection flow-control window, in bytes
    #[arg(long)]
    pub conn_flow_control_window: Option<u64>,

    /// Peer-initiated streams allowed per QUIC connection, per direction
    #[arg(long)]
    pub stream_count: Option<u64>,

    /// QUIC idle timeout
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Time allowed for QUIC connections to close cleanly
    #[arg(long)]
    pub disconnect_timeout_ms: Option<u64>,

    /// Enable ECN on QUIC connections
    #[arg(long)]
    pub ecn: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Which transports to serve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Quic,
    Tcp,
    #[default]
    Both,
}

impl Backend {
    pub fn quic(self) -> bool {
        matches!(self, Backend::Quic | Backend::Both)
    }

    pub fn tcp(self) -> bool {
        matches!(self, Backend::Tcp | Backend::Both)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CongestionControl {
    #[default]
    Cubic,
    Bbr,
    NewReno,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionProfile {
    #[default]
    LowLatency,
    MaxThroughput,
    Scavenger,
    RealTime,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub quic: QuicTomlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub backend: Backend,
    /// Number of TCP worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    pub teardown_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: Backend::default(),
            workers: None,
            max_connections: default_max_connections(),
            drain_timeout_ms: default_drain_timeout_ms(),
            teardown_port: None,
        }
    }
}

/// Per-stream send configuration
#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_io_size")]
    pub io_size: u32,
    #[serde(default = "default_send_buffer")]
    pub send_buffer: u64,
    #[serde(default)]
    pub buffered_io: bool,
    #[serde(default = "default_send_buffer_pool")]
    pub send_buffer_pool: usize,
    #[serde(default = "default_stream_pool")]
    pub stream_pool: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            io_size: default_io_size(),
            send_buffer: default_send_buffer(),
            buffered_io: false,
            send_buffer_pool: default_send_buffer_pool(),
            stream_pool: default_stream_pool(),
        }
    }
}

/// QUIC transport configuration
#[derive(Debug, Deserialize)]
pub struct QuicTomlConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub execution_profile: ExecutionProfile,
    #[serde(default)]
    pub congestion_control: CongestionControl,
    #[serde(default = "default_conn_flow_control_window")]
    pub conn_flow_control_window: u64,
    #[serde(default = "default_stream_count")]
    pub stream_count: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default)]
    pub ecn: bool,
}

impl Default for QuicTomlConfig {
    fn default() -> Self {
        Self {
            cert: None,
            key: None,
            execution_profile: ExecutionProfile::default(),
            congestion_control: CongestionControl::default(),
            conn_flow_control_window: default_conn_flow_control_window(),
            stream_count: default_stream_count(),
            idle_timeout_ms: default_idle_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            ecn: false,
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

fn default_listen() -> String {
    "[::]:4433".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

fn default_io_size() -> u32 {
    DEFAULT_IO_SIZE
}

fn default_send_buffer() -> u64 {
    DEFAULT_IDEAL_SEND_BUFFER
}

fn default_send_buffer_pool() -> usize {
    16 * 1024
}

fn default_stream_pool() -> usize {
    100_000
}

fn default_conn_flow_control_window() -> u64 {
    128 * 1024 * 1024 // 128 MB
}

fn default_stream_count() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_disconnect_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved QUIC settings
#[derive(Debug, Clone)]
pub struct QuicConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub execution_profile: ExecutionProfile,
    pub congestion_control: CongestionControl,
    pub conn_flow_control_window: u64,
    pub stream_count: u64,
    pub idle_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub ecn: bool,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backend: Backend,
    pub workers: usize,
    pub max_connections: usize,
    pub drain_timeout: Duration,
    pub teardown_port: Option<u16>,
    pub stream: StreamSettings,
    pub send_buffer_pool: usize,
    pub stream_pool: usize,
    pub quic: QuicConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
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

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(file.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|source| ConfigError::InvalidListen {
                value: listen.clone(),
                source,
            })?;

        let workers = match cli.workers.or(file.server.workers) {
            Some(0) | None => num_cpus(),
            Some(n) => n,
        };

        let config = Config {
            listen,
            backend: cli.backend.unwrap_or(file.server.backend),
            workers,
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            drain_timeout: Duration::from_millis(
                cli.drain_timeout_ms.unwrap_or(file.server.drain_timeout_ms),
            ),
            teardown_port: cli.teardown_port.or(file.server.teardown_port),
            stream: StreamSettings {
                io_size: cli.io_size.unwrap_or(file.stream.io_size),
                ideal_send_buffer: cli.send_buffer.unwrap_or(file.stream.send_buffer),
                buffered_io: cli.buffered_io || file.stream.buffered_io,
            },
            send_buffer_pool: cli.send_buffer_pool.unwrap_or(file.stream.send_buffer_pool),
            stream_pool: cli.stream_pool.unwrap_or(file.stream.stream_pool),
            quic: QuicConfig {
                cert: cli.cert.or(file.quic.cert),
                key: cli.key.or(file.quic.key),
                execution_profile: cli
                    .execution_profile
                    .unwrap_or(file.quic.execution_profile),
                congestion_control: cli
                    .congestion_control
                    .unwrap_or(file.quic.congestion_control),
                conn_flow_control_window: cli
                    .conn_flow_control_window
                    .unwrap_or(file.quic.conn_flow_control_window),
                stream_count: cli.stream_count.unwrap_or(file.quic.stream_count),
                idle_timeout: Duration::from_millis(
                    cli.idle_timeout_ms.unwrap_or(file.quic.idle_timeout_ms),
                ),
                disconnect_timeout: Duration::from_millis(
                    cli.disconnect_timeout_ms
                        .unwrap_or(file.quic.disconnect_timeout_ms),
                ),
                ecn: cli.ecn || file.quic.ecn,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.stream.io_size == 0, "io_size", "must be non-zero"),
            (
                self.stream.ideal_send_buffer == 0,
                "send_buffer",
                "must be non-zero",
            ),
            (self.send_buffer_pool == 0, "send_buffer_pool", "must be non-zero"),
            (self.stream_pool == 0, "stream_pool", "must be non-zero"),
            (self.max_connections == 0, "max_connections", "must be non-zero"),
            (self.quic.stream_count == 0, "stream_count", "must be non-zero"),
            (
                self.quic.cert.is_some() != self.quic.key.is_some(),
                "cert",
                "certificate and key must be configured together",
            ),
        ];

        match checks.into_iter().find(|(failed, _, _)| *failed) {
            Some((_, field, reason)) => Err(ConfigError::Invalid { field, reason }),
            None => Ok(()),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
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
    #[error("Invalid listen address '{value}': {source}")]
    InvalidListen {
        value: String,
        source: AddrParseError,
    },
    #[error("Invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
