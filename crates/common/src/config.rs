//! Server configuration: JSON file, defaults, and startup validation.
//!
//! The whole process reads one JSON document. Invalid configuration is
//! fatal — the server refuses to start serving on a config it cannot
//! validate.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors. `Invalid` carries a human-readable reason and is
/// raised by [`ServerConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Strategy for assigning a newly demanded instrument to an upstream
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    RoundRobin,
    LeastConnections,
    #[default]
    ConnectionQuality,
    HashBased,
}

/// One upstream front connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub connection_id: String,
    pub front_addr: String,
    pub broker_id: String,
    /// Subscription cap enforced per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    /// 1..10, smaller is higher.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_subscriptions() -> usize {
    500
}

fn default_priority() -> u8 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    #[serde(default)]
    pub load_balance_strategy: LoadBalanceStrategy,

    /// Health monitor tick, seconds.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Dispatcher maintenance tick, seconds.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval: u64,

    /// Upper bound on re-subscription attempts per instrument.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    #[serde(default = "default_auto_failover")]
    pub auto_failover: bool,

    pub connections: Vec<ConnectionConfig>,
}

fn default_websocket_port() -> u16 {
    7799
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_auto_failover() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            websocket_port: default_websocket_port(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            load_balance_strategy: LoadBalanceStrategy::default(),
            health_check_interval: default_health_check_interval(),
            maintenance_interval: default_maintenance_interval(),
            max_retry_count: default_max_retry_count(),
            auto_failover: default_auto_failover(),
            connections: vec![
                ConnectionConfig {
                    connection_id: "sim_primary".to_string(),
                    front_addr: "sim://primary".to_string(),
                    broker_id: "9999".to_string(),
                    max_subscriptions: 500,
                    priority: 1,
                    enabled: true,
                },
                ConnectionConfig {
                    connection_id: "sim_backup".to_string(),
                    front_addr: "sim://backup".to_string(),
                    broker_id: "9999".to_string(),
                    max_subscriptions: 500,
                    priority: 2,
                    enabled: true,
                },
            ],
        }
    }
}

impl ServerConfig {
    /// Load and validate a JSON config file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_json(&content)
    }

    /// Parse and validate a JSON config document.
    pub fn load_from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the invariants the rest of the system assumes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.websocket_port == 0 {
            return Err(ConfigError::Invalid("websocket_port must be non-zero".into()));
        }

        if self.connections.is_empty() {
            return Err(ConfigError::Invalid("at least one connection is required".into()));
        }

        let mut seen = HashSet::new();
        for conn in &self.connections {
            if conn.connection_id.is_empty() {
                return Err(ConfigError::Invalid("connection_id cannot be empty".into()));
            }
            if !seen.insert(conn.connection_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate connection_id: {}",
                    conn.connection_id
                )));
            }
            if conn.front_addr.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "front_addr cannot be empty for connection {}",
                    conn.connection_id
                )));
            }
            if conn.broker_id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "broker_id cannot be empty for connection {}",
                    conn.connection_id
                )));
            }
            if conn.max_subscriptions == 0 {
                return Err(ConfigError::Invalid(format!(
                    "max_subscriptions must be positive for connection {}",
                    conn.connection_id
                )));
            }
        }

        Ok(())
    }

    /// Redis connection URL for the quote store.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }

    /// Connections that are enabled in the config.
    pub fn enabled_connections(&self) -> impl Iterator<Item = &ConnectionConfig> {
        self.connections.iter().filter(|c| c.enabled)
    }
}
