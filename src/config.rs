//! Bridge configuration
//!
//! A single TOML file holds the device identity, the broker connection and
//! the handler selection. The file is read once at startup and written back on
//! exit, so settings adjusted at runtime (the enabled handler list) persist.

use crate::protocol::validate_device_id;
use crate::transport::mqtt::BrokerAddress;
use crate::transport::Credentials;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub handlers: HandlersSection,
}

/// Device section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier, used as client id and topic prefix
    #[serde(default = "default_device_id")]
    pub id: String,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            id: default_device_id(),
        }
    }
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://` or `mqtts://`
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Environment variable containing username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    /// Environment variable containing password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Reconnect timer period in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Delivery queue capacity (messages)
    #[serde(default = "default_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_true")]
    pub resubscribe_on_reconnect: bool,
    /// Inbound messages held for late registrations
    #[serde(default = "default_capacity")]
    pub overflow_capacity: usize,
    #[serde(default = "default_overflow_ttl_secs")]
    pub overflow_ttl_secs: u64,
    #[serde(default)]
    pub will: WillSection,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            username_env: None,
            password_env: None,
            auto_reconnect: true,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            queue_capacity: default_capacity(),
            resubscribe_on_reconnect: true,
            overflow_capacity: default_capacity(),
            overflow_ttl_secs: default_overflow_ttl_secs(),
            will: WillSection::default(),
        }
    }
}

impl MqttSection {
    /// Credentials from the configured environment variables
    ///
    /// A username without a password is sent with an empty password.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = get_env_var_optional(self.username_env.as_deref())?;
        let password = get_env_var_optional(self.password_env.as_deref()).unwrap_or_default();
        Some(Credentials { username, password })
    }
}

/// Last-will / online status section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Status topic, always placed under the device id
    #[serde(default = "default_will_topic")]
    pub topic: String,
    #[serde(default = "default_online_message")]
    pub online_message: String,
    #[serde(default = "default_offline_message")]
    pub offline_message: String,
    #[serde(default = "default_true")]
    pub retain: bool,
}

impl Default for WillSection {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: default_will_topic(),
            online_message: default_online_message(),
            offline_message: default_offline_message(),
            retain: true,
        }
    }
}

/// Handler selection and per-handler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HandlersSection {
    /// Handlers to load; empty means every built-in
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub uptime: UptimeConfig,
}

/// Relay handler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Topic root to copy from
    #[serde(default = "default_relay_source")]
    pub source: String,
    /// Topic root to copy to
    #[serde(default = "default_relay_target")]
    pub target: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            source: default_relay_source(),
            target: default_relay_target(),
        }
    }
}

/// Uptime handler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UptimeConfig {
    #[serde(default = "default_uptime_interval_secs")]
    pub interval_secs: u64,
}

impl Default for UptimeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_uptime_interval_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_device_id() -> String {
    "PC2MQTT".to_string()
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    10_000
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_capacity() -> usize {
    500
}

fn default_overflow_ttl_secs() -> u64 {
    30
}

fn default_will_topic() -> String {
    "status".to_string()
}

fn default_online_message() -> String {
    "Online".to_string()
}

fn default_offline_message() -> String {
    "Offline".to_string()
}

fn default_relay_source() -> String {
    "hermes/audioServer/hassio/playBytes".to_string()
}

fn default_relay_target() -> String {
    "hermes/audioServer/satZero1/playBytes".to_string()
}

fn default_uptime_interval_secs() -> u64 {
    60
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration back as TOML
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id).map_err(|e| {
            ConfigError::InvalidDeviceId(format!(
                "'{}' must match pattern [a-zA-Z0-9._-]+ ({e})",
                self.device.id
            ))
        })?;

        BrokerAddress::parse(&self.mqtt.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.mqtt.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.reconnect_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.will.enabled && self.mqtt.will.topic.trim_matches('/').is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.will.topic cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"

[mqtt]
broker_url = "mqtt://localhost:1883"
reconnect_interval_ms = 50
queue_capacity = 8
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn get_env_var_optional(env_var_name: Option<&str>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}
