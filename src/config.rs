//! Configuration for the cache client and the command-line tool.
//!
//! `ClientOptions` uses the option names common to memcached client
//! configuration (`client_timeout`, `socket_keepalive`, `no_ready_check`, ...).
//! The CLI reads an optional TOML file; CLI arguments take precedence over
//! config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default per-operation timeout in milliseconds
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 50;

/// Name reported for a connection until its server confirms readiness
pub const UNKNOWN_SERVER: &str = "unknown";

/// Client options, immutable once a connection is built
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientOptions {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Logical cache name, used in metric tags
    pub name: String,
    /// Per-operation timeout in milliseconds (0 = default)
    pub client_timeout: u64,
    /// Enable TCP keepalive on the socket
    pub socket_keepalive: bool,
    /// Queue requests while the transport is (re)connecting
    pub enable_offline_queue: bool,
    /// Skip the `version` probe before reporting ready
    pub no_ready_check: bool,
    /// Disable Nagle's algorithm
    pub socket_nodelay: bool,
    /// Dial timeout in milliseconds
    pub connect_timeout: u64,
    /// Delay between dial attempts in milliseconds
    pub retry_delay: u64,
    /// Prefix for metric names (`<namespace>.cache.time`)
    pub metrics_namespace: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 11211,
            name: "default".to_string(),
            client_timeout: DEFAULT_CLIENT_TIMEOUT_MS,
            socket_keepalive: true,
            enable_offline_queue: true,
            no_ready_check: false,
            socket_nodelay: true,
            connect_timeout: 1000,
            retry_delay: 1000,
            metrics_namespace: "application".to_string(),
        }
    }
}

impl ClientOptions {
    /// Options for `host:port` with every other field defaulted
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse a `host:port` server string
    pub fn from_server(server: &str) -> Result<Self, ConfigError> {
        let (host, port) = server
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidServer(server.to_string()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidServer(server.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidServer(server.to_string()))?;
        Ok(Self::new(host, port))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = millis_ceil(timeout);
        self
    }

    pub fn with_offline_queue(mut self, enabled: bool) -> Self {
        self.enable_offline_queue = enabled;
        self
    }

    pub fn with_ready_check(mut self, enabled: bool) -> Self {
        self.no_ready_check = !enabled;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = millis_ceil(delay);
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-operation timeout; a zero setting falls back to the default
    pub fn timeout(&self) -> Duration {
        let millis = if self.client_timeout == 0 {
            DEFAULT_CLIENT_TIMEOUT_MS
        } else {
            self.client_timeout
        };
        Duration::from_millis(millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }
}

/// Command-line arguments for the client tool
#[derive(Parser, Debug)]
#[command(name = "guarded-memcached")]
#[command(version = "0.1.0")]
#[command(about = "Run guarded operations against a memcached server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server to talk to (e.g., 127.0.0.1:11211)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Cache name used in metric tags
    #[arg(short, long)]
    pub name: Option<String>,

    /// Per-operation timeout in milliseconds
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub operation: Operation,
}

/// Operation to run
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Operation {
    /// Fetch a key and print its JSON value
    Get { key: String },
    /// Store a JSON value
    Set {
        key: String,
        /// Value as JSON (e.g., '{"a":1}' or '"text"')
        value: String,
        /// Expiration in seconds (0 = never)
        #[arg(long, default_value_t = 0)]
        ttl: u32,
    },
    /// Delete a key
    Delete { key: String },
    /// Update a key's expiration
    Expire { key: String, ttl: u32 },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub client: ClientOptions,
    #[serde(default)]
    pub logging: LoggingConfig,
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

/// Whole milliseconds, rounded up so sub-millisecond settings stay non-zero
fn millis_ceil(duration: Duration) -> u64 {
    let millis = duration.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration for the tool
#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientOptions,
    pub log_level: String,
    pub operation: Operation,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge CLI args over the TOML file they point at
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut client = toml_config.client;
        if let Some(server) = cli.server {
            let parsed = ClientOptions::from_server(&server)?;
            client.host = parsed.host;
            client.port = parsed.port;
        }
        if let Some(name) = cli.name {
            client.name = name;
        }
        if let Some(timeout_ms) = cli.timeout_ms {
            client.client_timeout = timeout_ms;
        }

        Ok(Config {
            client,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            operation: cli.operation,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid server address '{0}', expected host:port")]
    InvalidServer(String),
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
}
