//! Configuration loading for tether-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).
//! Every section and field is optional and falls back to the defaults below.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tether_types::{DeviceId, EndpointKind, UserId};

/// Root configuration for tether-relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,
    /// At-least-once delivery configuration.
    pub ack: AckConfig,
    /// Call engine configuration.
    pub calls: CallsConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Rate limiting configuration.
    pub limits: LimitsConfig,
    /// Cleanup task configuration.
    pub cleanup: CleanupConfig,
    /// Logging configuration.
    pub log: LogConfig,
    /// Static credentials for the bundled token verifier.
    pub auth: AuthConfig,
    /// Line metadata for the bundled line directory.
    pub lines: Vec<LineEntry>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for HTTP + WebSocket (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Outbound frames buffered per connection before drops (default: 64).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// At-least-once delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AckConfig {
    /// Delay before the first re-check, in milliseconds (default: 15000).
    #[serde(default = "default_ack_timeout_ms")]
    pub timeout_ms: u64,
    /// Multiplier applied to the delay after each re-emission (default: 2).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    /// Re-emissions before the failure sink is notified (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on a single re-check delay, in milliseconds (default: 120000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Call engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CallsConfig {
    /// Budget for line/contact enrichment of an incoming call (default: 1500ms).
    #[serde(default = "default_enrichment_timeout_ms")]
    pub enrichment_timeout_ms: u64,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// How long undelivered events are kept for redelivery, in seconds (default: 7 days).
    #[serde(default = "default_undelivered_ttl")]
    pub undelivered_ttl_secs: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Handshakes allowed per user per minute (default: 30).
    #[serde(default = "default_connections_per_user")]
    pub connections_per_user_per_minute: u32,
    /// Inbound events allowed per connection per minute (default: 600).
    #[serde(default = "default_events_per_minute")]
    pub events_per_minute: u32,
    /// Inbound events allowed per second across all connections (default: 5000).
    #[serde(default = "default_global_events_per_second")]
    pub global_events_per_second: u32,
    /// Live connections before new handshakes are refused (default: 10000).
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
    /// Largest accepted inbound frame in bytes (default: 64 KiB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 3600 = 1 hour).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

/// Static credential table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Accepted bearer tokens and the identities they resolve to.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One accepted bearer token.
#[derive(Clone, Deserialize)]
pub struct TokenEntry {
    /// Bearer credential.
    pub token: String,
    /// Owning user.
    pub user_id: UserId,
    /// Endpoint role.
    pub kind: EndpointKind,
    /// Telephony device (primary only).
    #[serde(default)]
    pub device_id: Option<DeviceId>,
}

impl std::fmt::Debug for TokenEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEntry")
            .field("token", &"[redacted]")
            .field("user_id", &self.user_id)
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Display metadata for one user's line.
#[derive(Debug, Clone, Deserialize)]
pub struct LineEntry {
    /// Owning user.
    pub user_id: UserId,
    /// Line identifier as reported by the primary.
    pub line_id: String,
    /// User-facing name.
    #[serde(default)]
    pub name: Option<String>,
    /// Display color.
    #[serde(default)]
    pub color: Option<String>,
    /// Carrier name.
    #[serde(default)]
    pub carrier: Option<String>,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_ack_timeout_ms() -> u64 {
    15_000
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_delay_ms() -> u64 {
    120_000
}

fn default_enrichment_timeout_ms() -> u64 {
    1_500
}

fn default_database_path() -> PathBuf {
    PathBuf::from("relay.db")
}

fn default_undelivered_ttl() -> u64 {
    7 * 24 * 60 * 60 // 7 days in seconds
}

fn default_connections_per_user() -> u32 {
    30
}

fn default_events_per_minute() -> u32 {
    600
}

fn default_global_events_per_second() -> u32 {
    5_000
}

fn default_max_concurrent_connections() -> usize {
    10_000
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_cleanup_interval() -> u64 {
    3600 // 1 hour
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_log_filter() -> String {
    "tether_relay=info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_ack_timeout_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retries: default_max_retries(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl AckConfig {
    /// Default delivery timeout for a fresh emission.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            enrichment_timeout_ms: default_enrichment_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            undelivered_ttl_secs: default_undelivered_ttl(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_user_per_minute: default_connections_per_user(),
            events_per_minute: default_events_per_minute(),
            global_events_per_second: default_global_events_per_second(),
            max_concurrent_connections: default_max_concurrent_connections(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
