//! Fleet configuration (`devices.json`) and device templates.

use crate::error::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thingsim::config::MqttSettings;
use tracing::{info, warn};

pub const DEFAULT_UPLOAD_INTERVAL_SECS: u64 = 30;
pub const TEMPLATE_FILE: &str = "template.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiDeviceConfig {
    #[serde(default)]
    pub device_groups: Vec<DeviceGroup>,
    #[serde(default)]
    pub global_config: GlobalConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub group_name: String,
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    /// Name of the template directory
    #[serde(default)]
    pub template: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 0 means unlimited
    #[serde(default)]
    pub max_instances: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub product_key: String,
    #[serde(default)]
    pub device_secret: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_config: HashMap<String, serde_json::Value>,
    /// Upload interval in seconds; 0 falls back to the global default
    #[serde(default)]
    pub interval: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default = "default_interval")]
    pub default_interval: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            default_interval: default_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            use_tls: false,
            keep_alive: default_keep_alive(),
            clean_session: true,
            auto_reconnect: true,
            region: default_region(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    DEFAULT_UPLOAD_INTERVAL_SECS
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

fn default_region() -> String {
    "cn-shanghai".to_string()
}

impl MultiDeviceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| SupervisorError::config(path, e))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| SupervisorError::config(path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SupervisorError::config(path, e))?;
        }
        let text =
            serde_json::to_string_pretty(self).map_err(|e| SupervisorError::config(path, e))?;
        std::fs::write(path, text).map_err(|e| SupervisorError::config(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_groups.is_empty() {
            return Err(SupervisorError::Invalid(
                "at least one device group is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for (i, group) in self.device_groups.iter().enumerate() {
            if group.group_name.trim().is_empty() {
                return Err(SupervisorError::Invalid(format!(
                    "device group {} has no name",
                    i
                )));
            }
            for device in &group.devices {
                if device.device_id.trim().is_empty() {
                    return Err(SupervisorError::Invalid(format!(
                        "group '{}' has a device without an id",
                        group.group_name
                    )));
                }
                if !seen.insert(device.device_id.as_str()) {
                    return Err(SupervisorError::Invalid(format!(
                        "duplicate device id '{}'",
                        device.device_id
                    )));
                }
                if device.product_key.is_empty()
                    || device.device_name.is_empty()
                    || device.device_secret.is_empty()
                {
                    return Err(SupervisorError::Invalid(format!(
                        "device '{}' is missing credentials",
                        device.device_id
                    )));
                }
            }
        }

        let mqtt = &self.global_config.mqtt;
        if mqtt.host.trim().is_empty() {
            return Err(SupervisorError::Invalid("MQTT host is required".into()));
        }
        if mqtt.port == 0 {
            return Err(SupervisorError::Invalid("MQTT port must be positive".into()));
        }
        Ok(())
    }

    /// Enabled devices of enabled groups, honoring each group's instance cap.
    pub fn enabled_devices(&self) -> Vec<(&DeviceGroup, &DeviceInfo)> {
        let mut out = Vec::new();
        for group in self.device_groups.iter().filter(|g| g.enabled) {
            let enabled = group.devices.iter().filter(|d| d.enabled);
            let capped: Box<dyn Iterator<Item = &DeviceInfo>> = if group.max_instances > 0 {
                Box::new(enabled.take(group.max_instances))
            } else {
                Box::new(enabled)
            };
            out.extend(capped.map(|d| (group, d)));
        }
        out
    }

    pub fn group(&self, name: &str) -> Option<&DeviceGroup> {
        self.device_groups.iter().find(|g| g.group_name == name)
    }

    pub fn device_by_id(&self, device_id: &str) -> Option<(&DeviceGroup, &DeviceInfo)> {
        self.device_groups.iter().find_map(|g| {
            g.devices
                .iter()
                .find(|d| d.device_id == device_id)
                .map(|d| (g, d))
        })
    }

    /// Appends `info` to `group_name` after checking the id is free.
    pub fn add_device(&mut self, group_name: &str, info: DeviceInfo) -> Result<()> {
        if self.device_by_id(&info.device_id).is_some() {
            return Err(SupervisorError::AlreadyExists(info.device_id));
        }
        let group = self
            .device_groups
            .iter_mut()
            .find(|g| g.group_name == group_name)
            .ok_or_else(|| SupervisorError::GroupNotFound(group_name.to_string()))?;
        group.devices.push(info);
        Ok(())
    }

    pub fn remove_device(&mut self, device_id: &str) -> Result<DeviceInfo> {
        for group in &mut self.device_groups {
            if let Some(pos) = group.devices.iter().position(|d| d.device_id == device_id) {
                return Ok(group.devices.remove(pos));
            }
        }
        Err(SupervisorError::NotFound(device_id.to_string()))
    }

    pub fn device_count(&self) -> usize {
        self.device_groups.iter().map(|g| g.devices.len()).sum()
    }
}

impl DeviceInfo {
    /// Device interval, then the fleet default, then 30 s.
    pub fn upload_interval(&self, default_interval: u64) -> Duration {
        let secs = if self.interval > 0 {
            self.interval
        } else if default_interval > 0 {
            default_interval
        } else {
            DEFAULT_UPLOAD_INTERVAL_SECS
        };
        Duration::from_secs(secs)
    }

    /// Global broker settings with `mqtt.host` / `mqtt.port` overrides
    /// from `custom_config`.
    pub fn effective_mqtt(&self, global: &MqttConfig) -> MqttSettings {
        let mut host = global.host.clone();
        let mut port = global.port;
        if let Some(mqtt) = self.custom_config.get("mqtt") {
            if let Some(h) = mqtt.get("host").and_then(|v| v.as_str()) {
                if !h.is_empty() {
                    host = h.to_string();
                }
            }
            if let Some(p) = mqtt
                .get("port")
                .and_then(|v| v.as_u64())
                .and_then(|p| u16::try_from(p).ok())
            {
                if p > 0 {
                    port = p;
                }
            }
        }
        MqttSettings {
            host,
            port,
            use_tls: global.use_tls,
            keep_alive: global.keep_alive,
            clean_session: global.clean_session,
            auto_reconnect: global.auto_reconnect,
        }
    }
}

/// A device type: model, rules and an optional base device config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTemplate {
    pub name: String,
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub description: String,
    pub tsl_file: PathBuf,
    pub rule_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    #[serde(skip)]
    pub template_path: PathBuf,
}

impl DeviceTemplate {
    /// Loads `<dir>/template.json`, resolving relative paths against `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let path = dir.join(TEMPLATE_FILE);
        let text =
            std::fs::read_to_string(&path).map_err(|e| SupervisorError::config(&path, e))?;
        let mut template: Self =
            serde_json::from_str(&text).map_err(|e| SupervisorError::config(&path, e))?;

        let resolve = |p: &Path| -> PathBuf {
            if p.is_relative() {
                dir.join(p)
            } else {
                p.to_path_buf()
            }
        };
        template.tsl_file = resolve(&template.tsl_file);
        template.rule_file = resolve(&template.rule_file);
        template.config_file = template.config_file.as_deref().map(resolve);
        template.template_path = dir.to_path_buf();
        Ok(template)
    }
}

/// Loads every template under `dir`, keyed by subdirectory name.
///
/// A missing directory is created and yields no templates. Subdirectories
/// whose template fails to load are skipped with a warning.
pub fn load_templates(dir: impl AsRef<Path>) -> Result<BTreeMap<String, DeviceTemplate>> {
    let dir = dir.as_ref();
    let mut templates = BTreeMap::new();
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| SupervisorError::config(dir, e))?;
        return Ok(templates);
    }

    let entries = std::fs::read_dir(dir).map_err(|e| SupervisorError::config(dir, e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        match DeviceTemplate::load(&path) {
            Ok(template) => {
                info!(template = %name, product_type = %template.product_type, "Loaded device template");
                templates.insert(name, template);
            }
            Err(e) => warn!(template = %name, error = %e, "Skipping device template"),
        }
    }
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: id.into(),
            device_name: format!("{}-name", id),
            product_key: "pk".into(),
            device_secret: "secret".into(),
            enabled: true,
            custom_config: HashMap::new(),
            interval: 0,
            tags: Vec::new(),
        }
    }

    fn group(name: &str, devices: Vec<DeviceInfo>) -> DeviceGroup {
        DeviceGroup {
            group_name: name.into(),
            product_type: "boiler".into(),
            devices,
            template: "boiler".into(),
            enabled: true,
            max_instances: 0,
        }
    }

    fn fleet(groups: Vec<DeviceGroup>) -> MultiDeviceConfig {
        MultiDeviceConfig {
            device_groups: groups,
            global_config: GlobalConfig::default(),
        }
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "device_groups": [{
                "group_name": "boilers",
                "template": "boiler",
                "devices": [{"device_id": "b1", "device_name": "n", "product_key": "pk", "device_secret": "s"}]
            }],
            "global_config": {"mqtt": {"host": "broker"}}
        }"#;
        let config: MultiDeviceConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        let group = &config.device_groups[0];
        assert!(group.enabled);
        assert_eq!(group.max_instances, 0);
        assert!(group.devices[0].enabled);
        assert_eq!(config.global_config.mqtt.host, "broker");
        assert_eq!(config.global_config.mqtt.port, 1883);
        assert_eq!(config.global_config.default_interval, 30);
    }

    #[test]
    fn test_validate_rejects_duplicates_and_gaps() {
        assert!(fleet(vec![]).validate().is_err());

        let dup = fleet(vec![group("a", vec![device("d1")]), group("b", vec![device("d1")])]);
        let err = dup.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate device id 'd1'"), "{}", err);

        let mut missing = device("d2");
        missing.device_secret.clear();
        assert!(fleet(vec![group("a", vec![missing])]).validate().is_err());

        assert!(fleet(vec![group(" ", vec![device("d3")])]).validate().is_err());

        let mut bad_port = fleet(vec![group("a", vec![device("d4")])]);
        bad_port.global_config.mqtt.port = 0;
        assert!(bad_port.validate().is_err());
    }

    #[test]
    fn test_enabled_devices_respects_caps() {
        let mut disabled = device("off");
        disabled.enabled = false;
        let mut capped = group("a", vec![device("a1"), disabled, device("a2"), device("a3")]);
        capped.max_instances = 2;
        let mut off_group = group("b", vec![device("b1")]);
        off_group.enabled = false;
        let config = fleet(vec![capped, off_group, group("c", vec![device("c1")])]);

        let ids: Vec<&str> = config
            .enabled_devices()
            .into_iter()
            .map(|(_, d)| d.device_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a1", "a2", "c1"]);
    }

    #[test]
    fn test_add_and_remove_device() {
        let mut config = fleet(vec![group("a", vec![device("d1")])]);

        assert!(matches!(
            config.add_device("a", device("d1")),
            Err(SupervisorError::AlreadyExists(_))
        ));
        assert!(matches!(
            config.add_device("nope", device("d2")),
            Err(SupervisorError::GroupNotFound(_))
        ));
        config.add_device("a", device("d2")).unwrap();
        assert_eq!(config.device_count(), 2);

        let removed = config.remove_device("d1").unwrap();
        assert_eq!(removed.device_id, "d1");
        assert!(matches!(
            config.remove_device("d1"),
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[test]
    fn test_upload_interval_precedence() {
        let mut d = device("d1");
        assert_eq!(d.upload_interval(0), Duration::from_secs(30));
        assert_eq!(d.upload_interval(10), Duration::from_secs(10));
        d.interval = 5;
        assert_eq!(d.upload_interval(10), Duration::from_secs(5));
    }

    #[test]
    fn test_custom_mqtt_overrides() {
        let global = MqttConfig::default();
        let mut d = device("d1");
        assert_eq!(d.effective_mqtt(&global).host, "localhost");

        d.custom_config.insert(
            "mqtt".into(),
            serde_json::json!({"host": "edge.local", "port": 8883}),
        );
        let mqtt = d.effective_mqtt(&global);
        assert_eq!(mqtt.host, "edge.local");
        assert_eq!(mqtt.port, 8883);
        assert_eq!(mqtt.keep_alive, 60);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs").join("devices.json");
        let config = fleet(vec![group("a", vec![device("d1")])]);
        config.save(&path).unwrap();
        assert_eq!(MultiDeviceConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_templates_resolves_paths_and_skips_broken() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("templates");
        assert!(load_templates(&root).unwrap().is_empty());
        assert!(root.is_dir());

        let boiler = root.join("boiler");
        std::fs::create_dir_all(&boiler).unwrap();
        std::fs::write(
            boiler.join(TEMPLATE_FILE),
            r#"{"name": "Boiler", "product_type": "boiler", "tsl_file": "tsl.json", "rule_file": "/abs/rule.json"}"#,
        )
        .unwrap();
        let broken = root.join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(TEMPLATE_FILE), "{not json").unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();

        let templates = load_templates(&root).unwrap();
        assert_eq!(templates.keys().collect::<Vec<_>>(), vec!["boiler"]);
        let t = &templates["boiler"];
        assert_eq!(t.tsl_file, boiler.join("tsl.json"));
        assert_eq!(t.rule_file, PathBuf::from("/abs/rule.json"));
        assert_eq!(t.template_path, boiler);
    }
}
