//! Per-device worker configuration.
//!
//! A JSON document with device credentials, broker settings and simulation
//! timing. Every section is optional; missing fields fall back to defaults
//! and `MQTT_HOST`, `PRODUCT_KEY`, `DEVICE_NAME` and `DEVICE_SECRET` override
//! whatever the file says.

use crate::error::{Result, SimError};
use crate::framework::DeviceIdentity;
use crate::runtime::RuntimeOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device: DeviceCredentials,
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCredentials {
    #[serde(default)]
    pub product_key: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub device_secret: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "cn-shanghai".to_string()
}

impl Default for DeviceCredentials {
    fn default() -> Self {
        Self {
            product_key: String::new(),
            device_name: String::new(),
            device_secret: String::new(),
            region: default_region(),
        }
    }
}

/// Broker settings, handed to the connectivity layer untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    /// Seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            use_tls: false,
            keep_alive: default_keep_alive(),
            clean_session: true,
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default = "default_upload_interval")]
    pub upload_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_service_delay")]
    pub service_delay_ms: u64,
}

fn default_upload_interval() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_service_delay() -> u64 {
    3000
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            upload_interval_secs: default_upload_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            service_delay_ms: default_service_delay(),
        }
    }
}

impl DeviceConfig {
    /// Reads a config file and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SimError::config(path, e))?;
        let mut config: DeviceConfig =
            serde_json::from_str(&text).map_err(|e| SimError::config(path, e))?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`; empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = get("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(key) = get("PRODUCT_KEY") {
            self.device.product_key = key;
        }
        if let Some(name) = get("DEVICE_NAME") {
            self.device.device_name = name;
        }
        if let Some(secret) = get("DEVICE_SECRET") {
            self.device.device_secret = secret;
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SimError::config(path, e))?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| SimError::config(path, e))?;
        std::fs::write(path, text).map_err(|e| SimError::config(path, e))
    }

    /// Identity for the framework; `device_id` falls back to
    /// `<product_key>.<device_name>`.
    pub fn identity(&self, device_id: Option<&str>) -> DeviceIdentity {
        let device_id = device_id
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.{}", self.device.product_key, self.device.device_name));
        DeviceIdentity {
            device_id,
            product_key: self.device.product_key.clone(),
            device_name: self.device.device_name.clone(),
        }
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            upload_interval: Duration::from_secs(self.simulation.upload_interval_secs.max(1)),
            heartbeat_interval: Duration::from_secs(self.simulation.heartbeat_interval_secs.max(1)),
            service_delay: Duration::from_millis(self.simulation.service_delay_ms),
        }
    }
}
