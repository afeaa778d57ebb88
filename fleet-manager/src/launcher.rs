//! The seam between supervision and the thing being supervised.
//!
//! A [`DeviceSupervisor`](crate::device::DeviceSupervisor) only knows how to
//! launch a unit, watch it exit, probe its liveness and shut it down. The
//! in-process and worker-process runners in [`crate::runners`] fill that in.

use crate::error::{Result, SupervisorError};
use crate::fleet_config::{DeviceGroup, DeviceInfo, DeviceTemplate, GlobalConfig};
use crate::journal::Journal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thingsim::config::{DeviceConfig, DeviceCredentials};
use thingsim::framework::DeviceIdentity;
use thingsim::runtime::{RuntimeOptions, RuntimeStats, RuntimeStatsSnapshot};

/// Everything needed to launch one device.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSpec {
    pub device_id: String,
    pub group: String,
    pub product_type: String,
    pub model_file: PathBuf,
    pub rule_file: PathBuf,
    /// Credentials, broker settings and timing handed to the unit
    pub config: DeviceConfig,
}

impl UnitSpec {
    /// Combines a fleet entry with its template.
    ///
    /// The template's base config, if any, supplies simulation timing; the
    /// fleet entry supplies credentials, broker settings and the upload
    /// interval.
    pub fn build(
        group: &DeviceGroup,
        info: &DeviceInfo,
        template: &DeviceTemplate,
        global: &GlobalConfig,
    ) -> Result<Self> {
        let mut config = match &template.config_file {
            Some(path) => DeviceConfig::load(path).map_err(|e| SupervisorError::Launch {
                device_id: info.device_id.clone(),
                source: e,
            })?,
            None => DeviceConfig::default(),
        };
        config.device = DeviceCredentials {
            product_key: info.product_key.clone(),
            device_name: info.device_name.clone(),
            device_secret: info.device_secret.clone(),
            region: global.mqtt.region.clone(),
        };
        config.mqtt = info.effective_mqtt(&global.mqtt);
        config.simulation.upload_interval_secs =
            info.upload_interval(global.default_interval).as_secs();

        let product_type = if group.product_type.is_empty() {
            template.product_type.clone()
        } else {
            group.product_type.clone()
        };

        Ok(Self {
            device_id: info.device_id.clone(),
            group: group.group_name.clone(),
            product_type,
            model_file: template.tsl_file.clone(),
            rule_file: template.rule_file.clone(),
            config,
        })
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.config.identity(Some(&self.device_id))
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        self.config.runtime_options()
    }

    pub fn upload_interval(&self) -> Duration {
        self.runtime_options().upload_interval
    }
}

/// Liveness view of a launched unit.
pub trait UnitProbe: Send + Sync {
    /// Last heartbeat, or last output line for worker processes.
    fn last_activity(&self) -> Option<DateTime<Utc>>;

    fn stats(&self) -> Option<RuntimeStatsSnapshot> {
        None
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

impl UnitProbe for RuntimeStats {
    fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat()
    }

    fn stats(&self) -> Option<RuntimeStatsSnapshot> {
        Some(self.snapshot())
    }
}

/// A unit that has been started.
#[async_trait]
pub trait LaunchedUnit: Send {
    fn probe(&self) -> Arc<dyn UnitProbe>;

    /// Resolves when the unit ends on its own. `Err` carries the crash cause.
    async fn exited(&mut self) -> std::result::Result<(), String>;

    /// Asks the unit to stop, forcing it after `grace`.
    async fn shutdown(&mut self, grace: Duration);
}

#[async_trait]
pub trait UnitLauncher: Send + Sync {
    async fn launch(&self, spec: &UnitSpec, journal: Arc<Journal>)
        -> Result<Box<dyn LaunchedUnit>>;

    /// Short name for logs.
    fn kind(&self) -> &'static str;
}
