//! Configuration module for the ringframe server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the frame server
#[derive(Parser, Debug)]
#[command(name = "ringframe")]
#[command(author = "ringframe authors")]
#[command(version = "0.1.0")]
#[command(about = "An io_uring TCP server for chunked frame transactions", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7400)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of dispatch threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// io_uring submission queue entries
    #[arg(long)]
    pub ring_size: Option<u32>,

    /// Size of each pooled buffer in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of dispatch threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            nodelay: default_nodelay(),
        }
    }
}

/// Completion queue and buffer configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Buffers kept in the pool for reuse
    #[serde(default = "default_pool_buffers")]
    pub pool_buffers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ring_size: default_ring_size(),
            buffer_size: default_buffer_size(),
            pool_buffers: default_pool_buffers(),
            poll_interval_ms: default_poll_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Frame protocol limits
#[derive(Debug, Deserialize, Default)]
pub struct ProtocolConfig {
    /// Largest accepted frame length field; unbounded when unset
    pub max_frame_len: Option<usize>,
    /// Largest reassembled transaction payload; unbounded when unset
    pub max_transaction_size: Option<usize>,
    /// Split echo replies into chunks of this size; one frame when unset
    pub chunk_size: Option<usize>,
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
    "127.0.0.1:7400".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_backlog() -> i32 {
    1024
}

fn default_nodelay() -> bool {
    true
}

fn default_ring_size() -> u32 {
    4096
}

fn default_buffer_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_pool_buffers() -> usize {
    1024
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_drain_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    /// 0 means one dispatch thread per CPU
    pub workers: usize,
    pub max_connections: usize,
    pub backlog: i32,
    pub nodelay: bool,
    pub ring_size: u32,
    pub buffer_size: usize,
    pub pool_buffers: usize,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub max_frame_len: Option<usize>,
    pub max_transaction_size: Option<usize>,
    pub chunk_size: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                path: path.clone(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            runtime,
            protocol,
            logging,
        } = toml_config;

        Config {
            listen: cli.listen.unwrap_or(server.listen),
            workers: cli.workers.or(server.workers).unwrap_or(0),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            backlog: server.backlog,
            nodelay: server.nodelay,
            ring_size: cli.ring_size.unwrap_or(runtime.ring_size),
            buffer_size: cli.buffer_size.unwrap_or(runtime.buffer_size),
            pool_buffers: runtime.pool_buffers,
            poll_interval: Duration::from_millis(runtime.poll_interval_ms),
            drain_timeout: Duration::from_millis(runtime.drain_timeout_ms),
            max_frame_len: protocol.max_frame_len,
            max_transaction_size: protocol.max_transaction_size,
            chunk_size: protocol.chunk_size,
            log_level: cli.log_level.unwrap_or(logging.level),
        }
    }

    /// Listener settings for this configuration.
    #[cfg(target_os = "linux")]
    pub fn listener_config(&self) -> Result<crate::runtime::ListenerConfig, ConfigError> {
        let addr = self
            .listen
            .parse()
            .map_err(|source| ConfigError::InvalidAddress {
                addr: self.listen.clone(),
                source,
            })?;

        Ok(crate::runtime::ListenerConfig {
            addr,
            backlog: self.backlog,
            workers: self.workers,
            ring_entries: self.ring_size,
            buffer_size: self.buffer_size,
            pool_buffers: self.pool_buffers,
            max_connections: self.max_connections,
            max_frame_len: self.max_frame_len,
            poll_interval: self.poll_interval,
            drain_timeout: self.drain_timeout,
            nodelay: self.nodelay,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid listen address '{addr}': {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("ringframe").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7400");
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.runtime.buffer_size, 16 * 1024);
        assert!(config.protocol.max_frame_len.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4
            max_connections = 128

            [runtime]
            ring_size = 512
            buffer_size = 4096
            poll_interval_ms = 50

            [protocol]
            max_frame_len = 65536
            chunk_size = 1024

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_connections, 128);
        assert!(config.server.nodelay);
        assert_eq!(config.runtime.ring_size, 512);
        assert_eq!(config.runtime.buffer_size, 4096);
        assert_eq!(config.runtime.drain_timeout_ms, 2000);
        assert_eq!(config.protocol.max_frame_len, Some(65536));
        assert_eq!(config.protocol.chunk_size, Some(1024));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--listen", "127.0.0.1:9100", "--buffer-size", "2048", "--log-level", "trace"]),
            toml_config,
        );

        assert_eq!(config.listen, "127.0.0.1:9100");
        assert_eq!(config.workers, 4);
        assert_eq!(config.buffer_size, 2048);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::from_args(cli(&["--config", "/nonexistent/ringframe.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
        assert!(err.to_string().contains("/nonexistent/ringframe.toml"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_listener_config() {
        let config = Config::merge(cli(&["-l", "127.0.0.1:0", "-w", "2"]), TomlConfig::default());
        let listener = config.listener_config().unwrap();
        assert_eq!(listener.addr, "127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap());
        assert_eq!(listener.workers, 2);
        assert_eq!(listener.ring_entries, 4096);

        let bad = Config::merge(cli(&["-l", "not-an-address"]), TomlConfig::default());
        assert!(matches!(
            bad.listener_config(),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }
}
