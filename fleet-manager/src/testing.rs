//! Fixtures shared by the unit tests.

use crate::fleet_config::{
    DeviceGroup, DeviceInfo, GlobalConfig, MultiDeviceConfig, TEMPLATE_FILE,
};
use std::collections::HashMap;
use std::path::Path;

pub const MODEL: &str = r#"{
    "properties": [
        {"identifier": "temperature", "name": "Temperature", "dataType": {"type": "float", "specs": {"min": "0.0", "max": "150.0"}}}
    ],
    "events": [],
    "actions": []
}"#;

pub const RULES: &str = r#"{
    "productName": "boiler",
    "simulationConfig": {
        "temperature": {"method": "fixed", "value": "21.5"}
    },
    "events": [],
    "services": {}
}"#;

/// Writes a `boiler` template under `root` and returns its directory.
pub fn write_template(root: &Path, rules: &str) -> std::path::PathBuf {
    let dir = root.join("boiler");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("tsl.json"), MODEL).unwrap();
    std::fs::write(dir.join("rule.json"), rules).unwrap();
    std::fs::write(
        dir.join("config.json"),
        r#"{"simulation": {"heartbeat_interval_secs": 1, "service_delay_ms": 1}}"#,
    )
    .unwrap();
    std::fs::write(
        dir.join(TEMPLATE_FILE),
        r#"{"name": "Boiler", "product_type": "boiler", "tsl_file": "tsl.json", "rule_file": "rule.json", "config_file": "config.json"}"#,
    )
    .unwrap();
    dir
}

pub fn device(id: &str) -> DeviceInfo {
    DeviceInfo {
        device_id: id.into(),
        device_name: id.into(),
        product_key: "pk".into(),
        device_secret: "secret".into(),
        enabled: true,
        custom_config: HashMap::new(),
        interval: 0,
        tags: Vec::new(),
    }
}

/// One enabled `boilers` group bound to the `boiler` template.
pub fn fleet(ids: &[&str]) -> MultiDeviceConfig {
    MultiDeviceConfig {
        device_groups: vec![DeviceGroup {
            group_name: "boilers".into(),
            product_type: "boiler".into(),
            devices: ids.iter().map(|id| device(id)).collect(),
            template: "boiler".into(),
            enabled: true,
            max_instances: 0,
        }],
        global_config: GlobalConfig::default(),
    }
}
