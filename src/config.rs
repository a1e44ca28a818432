//! Per-connection configuration model
//!
//! Defines the immutable description of one broker connection: identity,
//! connection parameters, reconnection policy and the symbolic handler keys
//! wired in at registration time. Definitions are loaded from TOML and
//! validated before any connection is established.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration: one `[[connection]]` table per broker connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConnectionsConfig {
    #[serde(default, rename = "connection")]
    pub connections: Vec<ConnectionDefinition>,
}

/// Immutable description of a single broker connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionDefinition {
    /// Connection name, unique together with `qualifier`
    pub name: String,
    /// Optional profile/variant qualifier
    pub qualifier: Option<String>,
    /// Client id presented to the broker; defaults to the key rendering
    pub client_id: Option<String>,
    /// Broker endpoint URI, e.g. `tcp://broker:1883` or `ssl://broker:8883`
    pub uri: String,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Start each session clean instead of resuming broker-side state
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// MQTT protocol version (3 = 3.1, 4 = 3.1.1)
    #[serde(default = "default_mqtt_version")]
    pub mqtt_version: u8,
    /// Timeout for a single connect attempt, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Environment variable holding the broker username
    pub username_env: Option<String>,
    /// Environment variable holding the broker password
    pub password_env: Option<String>,
    #[serde(default)]
    pub reconnection: ReconnectionPolicy,
    pub listener: Option<ListenerSpec>,
    pub publisher: Option<PublisherSpec>,
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_clean_session() -> bool {
    true
}

fn default_mqtt_version() -> u8 {
    4 // MQTT 3.1.1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

/// Composite connection identity: `(name, optional qualifier)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionKey {
    pub name: String,
    pub qualifier: Option<String>,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(qualifier) => write!(f, "{}.{}", self.name, qualifier),
            None => write!(f, "{}", self.name),
        }
    }
}

/// How a manager reacts to an unsolicited connection loss.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectionMode {
    /// Record the loss and do nothing else
    None,
    /// Forward the loss to the application handlers, no retry
    Delegate,
    /// Retry periodically until the connection is re-established
    #[default]
    Automatic,
}

/// Reconnection policy attached to exactly one definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectionPolicy {
    #[serde(default)]
    pub mode: ReconnectionMode,
    /// Retry period for `automatic` mode, in seconds
    #[serde(default = "default_reconnect_interval_secs")]
    pub interval_secs: u64,
}

fn default_reconnect_interval_secs() -> u64 {
    2
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            mode: ReconnectionMode::default(),
            interval_secs: default_reconnect_interval_secs(),
        }
    }
}

impl ReconnectionPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Topic filters to subscribe plus the listener handler key.
///
/// `topics` and `qos` are parallel sequences of equal length; each filter is
/// paired with the QoS level at the same index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerSpec {
    pub topics: Vec<String>,
    pub qos: Vec<u8>,
    /// Registry key of the application listener
    pub handler: String,
    pub pool: Option<PoolSpec>,
}

/// Registry key of the application delivery-confirmation handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherSpec {
    pub handler: String,
}

/// Bounded worker-pool sizing for pooled message dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSpec {
    #[serde(default = "default_core_workers")]
    pub core_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Registry key of the handler invoked on pool saturation
    pub reject_handler: Option<String>,
}

fn default_core_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    500
}

impl Default for PoolSpec {
    fn default() -> Self {
        Self {
            core_workers: default_core_workers(),
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            reject_handler: None,
        }
    }
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Duplicate connection key: {0}")]
    DuplicateKey(String),
    #[error("Connection {key}: {topics} topic filters but {qos} QoS levels")]
    TopicQosMismatch { key: String, topics: usize, qos: usize },
    #[error("Connection {key}: invalid QoS level {qos} (must be 0, 1 or 2)")]
    InvalidQos { key: String, qos: u8 },
    #[error("Connection {key}: listener configured with no topic filters")]
    EmptyTopicList { key: String },
    #[error("Connection {key}: worker pool must allow at least one worker")]
    ZeroWorkers { key: String },
    #[error("Connection {key}: automatic reconnection requires a non-zero interval")]
    ZeroReconnectInterval { key: String },
    #[error("Connection {key}: unsupported MQTT version {version} (must be 3 or 4)")]
    UnsupportedMqttVersion { key: String, version: u8 },
}

impl ConnectionDefinition {
    /// Composite identity of this definition.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            name: self.name.clone(),
            qualifier: self.qualifier.clone(),
        }
    }

    /// Client id presented to the broker.
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| self.key().to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Broker username, resolved from the environment at connect time.
    pub fn username(&self) -> Option<String> {
        self.username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Broker password, resolved from the environment at connect time.
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Validate this definition in isolation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = self.key().to_string();
        if !matches!(self.mqtt_version, 3 | 4) {
            return Err(ConfigError::UnsupportedMqttVersion {
                key,
                version: self.mqtt_version,
            });
        }
        if let Some(listener) = &self.listener {
            if listener.topics.is_empty() {
                return Err(ConfigError::EmptyTopicList { key });
            }
            if listener.topics.len() != listener.qos.len() {
                return Err(ConfigError::TopicQosMismatch {
                    key,
                    topics: listener.topics.len(),
                    qos: listener.qos.len(),
                });
            }
            if let Some(&qos) = listener.qos.iter().find(|&&qos| qos > 2) {
                return Err(ConfigError::InvalidQos { key, qos });
            }
            if let Some(pool) = &listener.pool {
                if pool.max_workers == 0 {
                    return Err(ConfigError::ZeroWorkers { key });
                }
            }
        }
        if self.reconnection.mode == ReconnectionMode::Automatic
            && self.reconnection.interval_secs == 0
        {
            return Err(ConfigError::ZeroReconnectInterval { key });
        }
        Ok(())
    }
}

impl ConnectionsConfig {
    /// Load and validate definitions from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ConnectionsConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every definition and the cross-definition key uniqueness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for definition in &self.connections {
            definition.validate()?;
            let key = definition.key();
            if !seen.insert(key.clone()) {
                return Err(ConfigError::DuplicateKey(key.to_string()));
            }
        }
        Ok(())
    }
}
