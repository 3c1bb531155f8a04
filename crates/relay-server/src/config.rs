//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (`RELAY_HOST`, `RELAY_PORT`, `RELAY_FILE_SIZE_LIMIT`)
//! - Nested environment overrides (`RELAY__SECTION__KEY`)
//! - TOML configuration file (`RELAY_CONFIG`, or the first of the default paths)

use anyhow::{ensure, Context, Result};
use relay_core::{KeepaliveConfig, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";

/// Environment variable overriding the file size limit.
pub const FILE_SIZE_LIMIT_ENV: &str = "RELAY_FILE_SIZE_LIMIT";

/// Default locations searched by [`Config::load`].
const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Publish validation limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Subscriber queue settings.
    #[serde(default)]
    pub subscribers: SubscribersConfig,

    /// Keepalive ping settings.
    #[serde(default)]
    pub keepalive: KeepaliveSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Publish validation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum announced file size in bytes. `0` disables size checks.
    #[serde(default = "default_file_size_limit")]
    pub file_size_limit: u64,

    /// Maximum length of one encoded file chunk.
    #[serde(default = "default_chunk_size_limit")]
    pub chunk_size_limit: usize,
}

/// Subscriber queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribersConfig {
    /// Envelopes buffered per subscriber.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Keepalive ping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveSection {
    /// Run the keepalive task.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds before the first ping.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Shortest gap between pings in seconds.
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,

    /// Gaps stay strictly below this many seconds.
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,

    /// Upper bound on ping padding.
    #[serde(default = "default_max_nonce_len")]
    pub max_nonce_len: u8,
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
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}

fn default_true() -> bool {
    true
}

fn default_file_size_limit() -> u64 {
    20 * 1024 * 1024 // 20 MB
}

fn default_chunk_size_limit() -> usize {
    2 * 1024 * 1024 // 2 MB
}

fn default_queue_capacity() -> usize {
    relay_core::registry::DEFAULT_QUEUE_CAPACITY
}

fn default_initial_delay() -> u64 {
    10
}

fn default_min_interval() -> u64 {
    2
}

fn default_max_interval() -> u64 {
    30
}

fn default_max_nonce_len() -> u8 {
    100
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            limits: LimitsConfig::default(),
            subscribers: SubscribersConfig::default(),
            keepalive: KeepaliveSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            file_size_limit: default_file_size_limit(),
            chunk_size_limit: default_chunk_size_limit(),
        }
    }
}

impl Default for SubscribersConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for KeepaliveSection {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_secs: default_initial_delay(),
            min_interval_secs: default_min_interval(),
            max_interval_secs: default_max_interval(),
            max_nonce_len: default_max_nonce_len(),
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

impl KeepaliveSection {
    /// Scheduler settings for the core keepalive task.
    #[must_use]
    pub fn to_keepalive_config(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            min_interval_secs: self.min_interval_secs,
            max_interval_secs: self.max_interval_secs,
            max_nonce_len: self.max_nonce_len,
        }
    }
}

impl SubscribersConfig {
    /// Registry settings.
    #[must_use]
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            queue_capacity: self.queue_capacity,
        }
    }
}

impl Config {
    /// Load configuration from the first file found, nested environment
    /// overrides and the file size limit variable.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// `RELAY_FILE_SIZE_LIMIT` is set but is not a number.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            let path = Path::new(expanded.as_ref());
            if path.exists() {
                builder = builder.add_source(
                    ::config::File::from(path).format(::config::FileFormat::Toml),
                );
                break;
            }
        }

        let settings = builder
            .add_source(::config::Environment::with_prefix("RELAY").separator("__"))
            .build()
            .context("Failed to assemble configuration")?;

        let mut config: Config = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        if let Ok(raw) = std::env::var(FILE_SIZE_LIMIT_ENV) {
            config.limits.file_size_limit = parse_size_limit(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file. The file size limit
    /// variable still applies.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let Ok(raw) = std::env::var(FILE_SIZE_LIMIT_ENV) {
            config.limits.file_size_limit = parse_size_limit(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check settings that deserialize fine but cannot work together.
    ///
    /// # Errors
    ///
    /// Returns an error if the keepalive interval range is empty.
    pub fn validate(&self) -> Result<()> {
        let keepalive = &self.keepalive;
        ensure!(
            keepalive.min_interval_secs < keepalive.max_interval_secs,
            "keepalive.min_interval_secs ({}) must be below keepalive.max_interval_secs ({})",
            keepalive.min_interval_secs,
            keepalive.max_interval_secs
        );
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Largest request body accepted by the publish endpoints.
    #[must_use]
    pub fn body_limit(&self) -> usize {
        self.limits.chunk_size_limit.saturating_add(64 * 1024)
    }
}

/// Parse a file size limit given in bytes.
///
/// # Errors
///
/// Returns an error if the value is not an unsigned integer.
pub fn parse_size_limit(raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .with_context(|| format!("Failed to parse {FILE_SIZE_LIMIT_ENV}: {raw:?}"))
}
