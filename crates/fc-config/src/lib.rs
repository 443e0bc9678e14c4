//! FlowCatalyst router configuration
//!
//! TOML-based configuration for the message router binary, with environment
//! variable overrides. This is deliberately scoped to what the router needs
//! to start: the HTTP health server, queue-to-pool bindings, and process
//! pool policy. Identity/OAuth, persistent stores, and the other
//! platform-level services a full FlowCatalyst deployment carries are not
//! this crate's concern.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root router application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub mediator: MediatorConfig,
    pub pools: Vec<PoolConfig>,
    pub queues: Vec<QueueConfig>,
    /// Enable development mode (LocalStack SQS, permissive defaults)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            mediator: MediatorConfig::default(),
            pools: Vec::new(),
            queues: Vec::new(),
            dev_mode: false,
        }
    }
}

/// HTTP health server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Default HTTP mediator behavior, applied to every pool unless a pool
/// overrides it (pools carry only routing/concurrency policy, not transport
/// settings — mirrors §6 of the router spec).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum connections per host in the shared HTTP client pool.
    pub max_connections_per_host: usize,
    /// Bounded retry attempts for transport/5xx errors before surfacing
    /// ERROR_PROCESS (the pool itself never retries).
    pub max_retry_attempts: u32,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_connections_per_host: 100,
            max_retry_attempts: 3,
        }
    }
}

/// One named process pool's routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    pub rate_limit_per_minute: Option<u32>,
    /// Hard upper bound on admitted-but-unprocessed pointers. `None` derives
    /// a default from concurrency.
    pub queue_capacity: Option<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            code: String::new(),
            concurrency: 10,
            rate_limit_per_minute: None,
            queue_capacity: None,
        }
    }
}

/// A queue source bound to a pool by the consumer's `poolCode` routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub uri: String,
    pub connections: u32,
    pub visibility_timeout: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            uri: String::new(),
            connections: 1,
            visibility_timeout: 120,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# FlowCatalyst Router Configuration
# Environment variables override these settings

[http]
port = 8080
host = "0.0.0.0"

[mediator]
timeout_ms = 10000
max_connections_per_host = 100
max_retry_attempts = 3

dev_mode = false

[[pools]]
code = "DEFAULT"
concurrency = 10

[[pools]]
code = "HIGH"
concurrency = 20

[[pools]]
code = "LOW"
concurrency = 5
rate_limit_per_minute = 60

[[queues]]
name = "fc-default.fifo"
uri = "https://sqs.eu-west-1.amazonaws.com/000000000000/fc-default.fifo"
connections = 2
visibility_timeout = 120
"#
        .to_string()
    }
}
