//! Device directories for simple mode.
//!
//! A device path holds one subdirectory per device, named `device*`, each
//! with its own `config.json`, `tsl.json` and `rule.json`:
//!
//! ```text
//! devices/
//! ├── device1/   config.json  tsl.json  rule.json
//! ├── device2/   config.json  tsl.json  rule.json
//! └── notes/     (ignored)
//! ```
//!
//! Directories missing any of the three files are skipped with a warning.

use crate::error::{Result, SupervisorError};
use crate::launcher::UnitSpec;
use std::path::{Path, PathBuf};
use thingsim::config::DeviceConfig;
use tracing::{info, warn};

pub const DEVICE_DIR_PREFIX: &str = "device";
pub const CONFIG_FILE: &str = "config.json";
pub const MODEL_FILE: &str = "tsl.json";
pub const RULE_FILE: &str = "rule.json";

/// Group name given to units started from device directories.
pub const SIMPLE_GROUP: &str = "simple";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDir {
    /// Directory name, used as the device id
    pub name: String,
    pub path: PathBuf,
}

impl DeviceDir {
    pub fn config_file(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn model_file(&self) -> PathBuf {
        self.path.join(MODEL_FILE)
    }

    pub fn rule_file(&self) -> PathBuf {
        self.path.join(RULE_FILE)
    }

    /// First of the required files that is absent.
    fn missing_file(&self) -> Option<&'static str> {
        [CONFIG_FILE, MODEL_FILE, RULE_FILE]
            .into_iter()
            .find(|file| !self.path.join(file).is_file())
    }

    /// Reads the directory's `config.json` into a launchable unit.
    pub fn unit_spec(&self) -> Result<UnitSpec> {
        let config = DeviceConfig::load(self.config_file()).map_err(|source| SupervisorError::Launch {
            device_id: self.name.clone(),
            source,
        })?;
        Ok(UnitSpec {
            device_id: self.name.clone(),
            group: SIMPLE_GROUP.to_string(),
            product_type: String::new(),
            model_file: self.model_file(),
            rule_file: self.rule_file(),
            config,
        })
    }
}

/// Lists complete `device*` directories under `root`, sorted by name.
pub fn scan_device_dirs(root: impl AsRef<Path>) -> Result<Vec<DeviceDir>> {
    let root = root.as_ref();
    let entries = std::fs::read_dir(root).map_err(|e| SupervisorError::config(root, e))?;

    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        if !name.starts_with(DEVICE_DIR_PREFIX) {
            continue;
        }
        let dir = DeviceDir { name, path };
        if let Some(missing) = dir.missing_file() {
            warn!(device_dir = %dir.name, missing, "Skipping device directory");
            continue;
        }
        dirs.push(dir);
    }
    dirs.sort_by(|a, b| a.name.cmp(&b.name));

    info!(root = %root.display(), count = dirs.len(), "Scanned device directories");
    Ok(dirs)
}

/// Builds a unit for every complete device directory under `root`.
/// Directories whose config cannot be read are skipped with a warning.
pub fn unit_specs(root: impl AsRef<Path>) -> Result<Vec<UnitSpec>> {
    let specs = scan_device_dirs(root)?
        .iter()
        .filter_map(|dir| match dir.unit_spec() {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(device_dir = %dir.name, error = %e, "Skipping device directory");
                None
            }
        })
        .collect();
    Ok(specs)
}
