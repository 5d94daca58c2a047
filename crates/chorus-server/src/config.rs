//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (CHORUS_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use chorus_core::{HubConfig, RouterConfig, StaticAuthorizer};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Hub behaviour.
    #[serde(default)]
    pub hub: HubSection,

    /// Message history.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Static group membership table.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum encoded frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum groups a single connection may join.
    #[serde(default = "default_max_groups")]
    pub max_groups_per_connection: usize,

    /// Maximum message content size in bytes.
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds, as advertised to clients.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u32,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
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

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Join every group of the user when a connection opens.
    #[serde(default = "default_true")]
    pub auto_join: bool,
}

/// History configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum messages returned for one history request.
    #[serde(default = "default_replay_limit")]
    pub replay_limit: usize,

    /// Messages kept per group.
    #[serde(default = "default_retention")]
    pub retention: usize,
}

/// One entry of the static membership table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group id.
    pub id: String,
    /// Users allowed in the group.
    #[serde(default)]
    pub members: Vec<String>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("CHORUS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("CHORUS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_frame_size() -> usize {
    chorus_protocol::codec::MAX_FRAME_SIZE
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_groups() -> usize {
    chorus_core::membership::DEFAULT_MAX_GROUPS_PER_CONNECTION
}

fn default_max_content_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_buffer() -> usize {
    1024
}

fn default_heartbeat_interval() -> u32 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_replay_limit() -> usize {
    100
}

fn default_retention() -> usize {
    chorus_core::MemoryStore::DEFAULT_RETENTION
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            hub: HubSection::default(),
            history: HistoryConfig::default(),
            groups: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_groups_per_connection: default_max_groups(),
            max_content_size: default_max_content_size(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
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

impl Default for HubSection {
    fn default() -> Self {
        Self { auto_join: true }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            replay_limit: default_replay_limit(),
            retention: default_retention(),
        }
    }
}

impl Config {
    /// Load configuration from `CHORUS_CONFIG`, a default path, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("CHORUS_CONFIG") {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        let config_paths = [
            "chorus.toml",
            "/etc/chorus/chorus.toml",
            "~/.config/chorus/chorus.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
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

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Hub settings derived from the limits, hub and history sections.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            router: RouterConfig {
                max_content_size: self.limits.max_content_size,
            },
            max_groups_per_connection: self.limits.max_groups_per_connection,
            auto_join: self.hub.auto_join,
            history_limit: self.history.replay_limit,
        }
    }

    /// Authorization table built from `[[groups]]`.
    #[must_use]
    pub fn authorizer(&self) -> StaticAuthorizer {
        self.groups
            .iter()
            .fold(StaticAuthorizer::new(), |auth, group| {
                auth.with_group(group.id.as_str(), group.members.iter().map(String::as_str))
            })
    }
}
