//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`relay.toml`, `/etc/relay/relay.toml`,
//!   `~/.config/relay/relay.toml`, first match wins)
//! - Environment variables (`RELAY_*`, nested keys joined with `__`,
//!   e.g. `RELAY_LIMITS__QUEUE_DEPTH`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind both listeners to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the request/reply listener.
    #[serde(default = "default_request_port")]
    pub request_port: u16,

    /// Port of the subscriber (WebSocket) listener.
    #[serde(default = "default_subscribe_port")]
    pub subscribe_port: u16,

    /// Directory holding the record logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest request frame in bytes. Larger frames close the connection.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Maximum number of live subscriber topics.
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,

    /// Maximum subscriptions per subscriber connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Requests waiting for the dispatcher before senders are held back.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Records buffered per topic before slow subscribers start lagging.
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_request_port() -> u16 {
    5556
}

fn default_subscribe_port() -> u16 {
    5558
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_true() -> bool {
    true
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_max_topics() -> usize {
    10_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_queue_depth() -> usize {
    1024
}

fn default_topic_capacity() -> usize {
    1024
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            request_port: default_request_port(),
            subscribe_port: default_subscribe_port(),
            data_dir: default_data_dir(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_topics: default_max_topics(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            queue_depth: default_queue_depth(),
            topic_capacity: default_topic_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with `RELAY_*`
    /// environment variables layered on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        for path in CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            let path = Path::new(expanded.as_ref());
            if path.exists() {
                info!(path = %path.display(), "Loading config file");
                builder = builder.add_source(
                    config::File::from(path).format(config::FileFormat::Toml),
                );
                break;
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Socket address of the request listener.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn request_addr(&self) -> Result<SocketAddr> {
        self.socket_addr(self.request_port)
    }

    /// Socket address of the subscriber listener.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn subscribe_addr(&self) -> Result<SocketAddr> {
        self.socket_addr(self.subscribe_port)
    }

    fn socket_addr(&self, port: u16) -> Result<SocketAddr> {
        format!("{}:{}", self.host, port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, port))
    }
}
