//! Configuration management.

use serde::Deserialize;

use crate::error::Result;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Messenger configuration
    #[serde(default)]
    pub messenger: MessengerConfig,

    /// Entity store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessengerConfig {
    /// Outbound queue length per connection
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Maximum inbound frame size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Whether connections bind on first read unless they opt out
    #[serde(default)]
    pub live_by_default: bool,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
            max_message_size: default_max_message_size(),
            live_by_default: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Entity types registered with the dispatcher at startup
    #[serde(default = "default_entities")]
    pub entities: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            entities: default_entities(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_outbound_buffer() -> usize { 256 }
fn default_max_message_size() -> usize { 1024 * 1024 }
fn default_entities() -> Vec<String> { vec!["task".to_string()] }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("MODELSYNC").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MODELSYNC").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
