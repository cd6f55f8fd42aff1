//! # Configuration
//!
//! TOML configuration for the radio link engine. Every section carries serde
//! defaults so a partial file (or an empty one) loads cleanly.
//!
//! ```toml
//! [radio]
//! preferred_peripherals = ["6F1C2A54-0000-4000-8000-00000000BEEF"]
//! minimum_firmware_version = "2.0.0"
//! connect_timeout_ms = 1500
//! connect_timeout_attempts = 10
//!
//! [location]
//! provide_location = true
//! interval_secs = 30
//!
//! [notifications]
//! low_battery_threshold = 4
//!
//! [persistence]
//! snapshot_path = "data/meshlink.json"
//! ```
//!
//! The read-only view handed to the link engine is [`RuntimePreferences`],
//! derived with [`Config::runtime_preferences`].

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Peripheral ids in preference order, most recently connected first.
    #[serde(default)]
    pub preferred_peripherals: Vec<String>,
    /// Node numbers in preference order, most recently seen first.
    #[serde(default)]
    pub preferred_nodes: Vec<u32>,
    #[serde(default = "default_minimum_firmware_version")]
    pub minimum_firmware_version: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_attempts")]
    pub connect_timeout_attempts: u32,
    /// Seconds to wait for the config-complete echo before re-issuing want-config.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_handshake_max_attempts")]
    pub handshake_max_attempts: u32,
    /// Upper bound on app-port packets held back until config-complete.
    #[serde(default = "default_deferred_packet_limit")]
    pub deferred_packet_limit: usize,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Show synthetic range-test payloads ("seq N") as messages.
    #[serde(default)]
    pub want_range_test_packets: bool,
    /// Handle store-and-forward router traffic.
    #[serde(default)]
    pub want_store_and_forward_packets: bool,
}

fn default_minimum_firmware_version() -> String {
    "2.0.0".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    1500
}
fn default_connect_timeout_attempts() -> u32 {
    10
}
fn default_handshake_timeout_secs() -> u64 {
    30
}
fn default_handshake_max_attempts() -> u32 {
    3
}
fn default_deferred_packet_limit() -> usize {
    256
}
fn default_true() -> bool {
    true
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            preferred_peripherals: Vec::new(),
            preferred_nodes: Vec::new(),
            minimum_firmware_version: default_minimum_firmware_version(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_timeout_attempts: default_connect_timeout_attempts(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            handshake_max_attempts: default_handshake_max_attempts(),
            deferred_packet_limit: default_deferred_packet_limit(),
            auto_reconnect: true,
            want_range_test_packets: false,
            want_store_and_forward_packets: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    #[serde(default)]
    pub provide_location: bool,
    #[serde(default = "default_location_interval_secs")]
    pub interval_secs: u64,
}

fn default_location_interval_secs() -> u64 {
    30
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            provide_location: false,
            interval_secs: default_location_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub direct_messages: bool,
    #[serde(default = "default_true")]
    pub channel_messages: bool,
    #[serde(default = "default_true")]
    pub low_battery: bool,
    #[serde(default)]
    pub detection_sensor: bool,
    /// Battery percentage below which a low battery notification is queued.
    #[serde(default = "default_low_battery_threshold")]
    pub low_battery_threshold: u32,
}

fn default_low_battery_threshold() -> u32 {
    4
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            direct_messages: true,
            channel_messages: true,
            low_battery: true,
            detection_sensor: false,
            low_battery_threshold: default_low_battery_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON snapshot file. In-memory only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    500
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
}

fn default_pending_ttl_secs() -> u64 {
    300
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: default_pending_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_client_id_prefix() -> String {
    "meshlink".to_string()
}
fn default_keep_alive_secs() -> u64 {
    30
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// User-facing settings the link engine reads but never writes.
#[derive(Debug, Clone)]
pub struct RuntimePreferences {
    pub preferred_peripherals: Vec<String>,
    pub preferred_nodes: Vec<u32>,
    pub auto_reconnect: bool,
    pub minimum_firmware_version: String,
    pub connect_timeout: Duration,
    pub connect_timeout_attempts: u32,
    pub handshake_timeout: Duration,
    pub handshake_max_attempts: u32,
    pub deferred_packet_limit: usize,
    pub provide_location: bool,
    pub location_interval: Duration,
    pub direct_message_notifications: bool,
    pub channel_message_notifications: bool,
    pub low_battery_notifications: bool,
    pub detection_sensor_notifications: bool,
    pub low_battery_threshold: u32,
    pub want_range_test_packets: bool,
    pub want_store_and_forward_packets: bool,
    pub admin_pending_ttl: Duration,
    pub debounce_window: Duration,
    pub mqtt_client_id_prefix: String,
    pub mqtt_keep_alive: Duration,
}

impl Default for RuntimePreferences {
    fn default() -> Self {
        Config::default().runtime_preferences()
    }
}

impl RuntimePreferences {
    pub fn is_preferred_peripheral(&self, peripheral_id: &str) -> bool {
        self.preferred_peripherals
            .first()
            .map(|p| p == peripheral_id)
            .unwrap_or(false)
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn runtime_preferences(&self) -> RuntimePreferences {
        RuntimePreferences {
            preferred_peripherals: self.radio.preferred_peripherals.clone(),
            preferred_nodes: self.radio.preferred_nodes.clone(),
            auto_reconnect: self.radio.auto_reconnect,
            minimum_firmware_version: self.radio.minimum_firmware_version.clone(),
            connect_timeout: Duration::from_millis(self.radio.connect_timeout_ms.max(1)),
            connect_timeout_attempts: self.radio.connect_timeout_attempts,
            handshake_timeout: Duration::from_secs(self.radio.handshake_timeout_secs.max(1)),
            handshake_max_attempts: self.radio.handshake_max_attempts.max(1),
            deferred_packet_limit: self.radio.deferred_packet_limit,
            provide_location: self.location.provide_location,
            location_interval: Duration::from_secs(self.location.interval_secs.max(1)),
            direct_message_notifications: self.notifications.direct_messages,
            channel_message_notifications: self.notifications.channel_messages,
            low_battery_notifications: self.notifications.low_battery,
            detection_sensor_notifications: self.notifications.detection_sensor,
            low_battery_threshold: self.notifications.low_battery_threshold,
            want_range_test_packets: self.radio.want_range_test_packets,
            want_store_and_forward_packets: self.radio.want_store_and_forward_packets,
            admin_pending_ttl: Duration::from_secs(self.admin.pending_ttl_secs),
            debounce_window: Duration::from_millis(self.persistence.debounce_ms),
            mqtt_client_id_prefix: self.mqtt.client_id_prefix.clone(),
            mqtt_keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs.max(5)),
        }
    }
}
