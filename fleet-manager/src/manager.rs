//! Fleet supervisor - runs every configured device under a
//! [`DeviceSupervisor`] and keeps them alive.
//!
//! The fleet comes from a [`MultiDeviceConfig`] document plus a directory of
//! device templates. A background sweep checks every unit on a fixed
//! interval, moves silent units to `Error` and restarts those still within
//! their restart budget.

use crate::device::{DeviceSupervisor, SupervisorPolicy, UnitStats, UnitStatus};
use crate::error::{Result, SupervisorError};
use crate::fleet_config::{load_templates, DeviceGroup, DeviceInfo, DeviceTemplate, MultiDeviceConfig};
use crate::journal::{
    FleetEvent, FleetEventKind, Journal, LogEntry, LogLevel, DEFAULT_EVENT_CAPACITY,
    DEFAULT_LOG_CAPACITY, MANAGER_ID,
};
use crate::launcher::{UnitLauncher, UnitSpec};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

type UnitMap = Arc<RwLock<HashMap<String, DeviceSupervisor>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct FleetOptions {
    pub sweep_interval: Duration,
    /// Upper bound on stopping the whole fleet
    pub stop_timeout: Duration,
    pub log_capacity: usize,
    pub event_capacity: usize,
    pub policy: SupervisorPolicy,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(30),
            log_capacity: DEFAULT_LOG_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            policy: SupervisorPolicy::default(),
        }
    }
}

/// Aggregate view of the fleet.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStats {
    pub total_devices: usize,
    pub running_devices: usize,
    pub error_devices: usize,
    pub devices: BTreeMap<String, UnitStats>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub dropped_logs: u64,
    pub dropped_events: u64,
}

/// What one health sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub stale: usize,
    pub restarted: usize,
}

pub struct FleetSupervisor {
    config_path: PathBuf,
    template_dir: PathBuf,
    launcher: Arc<dyn UnitLauncher>,
    options: FleetOptions,
    journal: Arc<Journal>,
    config: RwLock<Option<MultiDeviceConfig>>,
    templates: RwLock<BTreeMap<String, DeviceTemplate>>,
    units: UnitMap,
    running: AtomicBool,
    sweep: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl FleetSupervisor {
    /// # Arguments
    /// * `config_path` - Fleet document (`devices.json`)
    /// * `template_dir` - Directory of template subdirectories
    /// * `launcher` - How units are run
    pub fn new(
        config_path: impl Into<PathBuf>,
        template_dir: impl Into<PathBuf>,
        launcher: Arc<dyn UnitLauncher>,
        options: FleetOptions,
    ) -> Self {
        let journal = Arc::new(Journal::new(options.log_capacity, options.event_capacity));
        Self {
            config_path: config_path.into(),
            template_dir: template_dir.into(),
            launcher,
            options,
            journal,
            config: RwLock::new(None),
            templates: RwLock::new(BTreeMap::new()),
            units: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
            sweep: Mutex::new(None),
            started_at: Mutex::new(None),
        }
    }

    /// A fleet with no fleet document or templates behind it. Units come
    /// from [`FleetSupervisor::start_units`]; `start` and `add_device` are
    /// unavailable.
    pub fn detached(launcher: Arc<dyn UnitLauncher>, options: FleetOptions) -> Self {
        Self::new(PathBuf::new(), PathBuf::new(), launcher, options)
    }

    fn is_detached(&self) -> bool {
        self.config_path.as_os_str().is_empty()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn options(&self) -> &FleetOptions {
        &self.options
    }

    pub fn journal(&self) -> Arc<Journal> {
        self.journal.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn config(&self) -> Option<MultiDeviceConfig> {
        self.config.read().await.clone()
    }

    pub async fn templates(&self) -> BTreeMap<String, DeviceTemplate> {
        self.templates.read().await.clone()
    }

    /// Reads the fleet document and the template directory.
    pub async fn load_config(&self) -> Result<()> {
        let config = MultiDeviceConfig::load(&self.config_path)?;
        let templates = load_templates(&self.template_dir)?;
        self.journal.log(
            MANAGER_ID,
            LogLevel::Info,
            format!(
                "Loaded {} device groups ({} devices) and {} templates",
                config.device_groups.len(),
                config.device_count(),
                templates.len()
            ),
        );
        *self.config.write().await = Some(config);
        *self.templates.write().await = templates;
        Ok(())
    }

    /// Loads configuration, starts every enabled device and begins the
    /// health sweep.
    ///
    /// Devices that fail to start are logged and skipped.
    ///
    /// # Returns
    /// Number of devices started
    pub async fn start(&self) -> Result<usize> {
        if self.is_detached() {
            return Err(SupervisorError::Invalid(
                "fleet has no configuration to start from".into(),
            ));
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SupervisorError::FleetRunning);
        }
        if let Err(e) = self.load_config().await {
            self.running.store(false, Ordering::Release);
            return Err(e);
        }
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        let config = self.config().await.unwrap_or_default();
        let enabled = config.enabled_devices();
        let mut started = 0;
        for (group, device) in &enabled {
            match self.launch_device(group, device).await {
                Ok(()) => started += 1,
                Err(e) => self.journal.log(
                    &device.device_id,
                    LogLevel::Warn,
                    format!("Failed to start device: {}", e),
                ),
            }
        }

        self.begin_sweep();
        self.journal.log(
            MANAGER_ID,
            LogLevel::Info,
            format!(
                "Fleet started: {} of {} enabled devices ({} launcher)",
                started,
                enabled.len(),
                self.launcher.kind()
            ),
        );
        Ok(started)
    }

    /// Starts the given units and begins the health sweep, without a fleet
    /// document. Units that fail to start are logged and skipped.
    ///
    /// # Returns
    /// Number of units started
    pub async fn start_units(&self, specs: Vec<UnitSpec>) -> Result<usize> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SupervisorError::FleetRunning);
        }
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        let total = specs.len();
        let mut started = 0;
        for spec in specs {
            let device_id = spec.device_id.clone();
            match self.supervise(spec).await {
                Ok(()) => started += 1,
                Err(e) => self.journal.log(
                    &device_id,
                    LogLevel::Warn,
                    format!("Failed to start device: {}", e),
                ),
            }
        }

        self.begin_sweep();
        self.journal.log(
            MANAGER_ID,
            LogLevel::Info,
            format!(
                "Fleet started: {} of {} units ({} launcher)",
                started,
                total,
                self.launcher.kind()
            ),
        );
        Ok(started)
    }

    fn begin_sweep(&self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_health_sweep(
            self.units.clone(),
            self.journal.clone(),
            self.options.sweep_interval,
            shutdown_rx,
        ));
        *self.sweep.lock().unwrap_or_else(|e| e.into_inner()) = Some((shutdown_tx, handle));
    }

    /// Builds a supervisor for `device` and starts it.
    async fn launch_device(&self, group: &DeviceGroup, device: &DeviceInfo) -> Result<()> {
        let spec = {
            let templates = self.templates.read().await;
            let template = templates
                .get(&group.template)
                .ok_or_else(|| SupervisorError::TemplateNotFound(group.template.clone()))?;
            let global = self
                .config
                .read()
                .await
                .as_ref()
                .map(|c| c.global_config.clone())
                .unwrap_or_default();
            UnitSpec::build(group, device, template, &global)?
        };
        self.supervise(spec).await
    }

    /// Puts `spec` under a new supervisor and starts it. Refused when the
    /// device is already supervised.
    async fn supervise(&self, spec: UnitSpec) -> Result<()> {
        let device_id = spec.device_id.clone();
        let supervisor = DeviceSupervisor::new(
            spec,
            self.launcher.clone(),
            self.journal.clone(),
            self.options.policy.clone(),
        );
        let mut units = self.units.write().await;
        match units.entry(device_id) {
            Entry::Occupied(slot) => Err(SupervisorError::AlreadyRunning(slot.key().clone())),
            Entry::Vacant(slot) => {
                supervisor.start()?;
                slot.insert(supervisor);
                Ok(())
            }
        }
    }

    /// Stops the sweep and every unit, waiting at most the stop timeout.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Stopping fleet supervisor");

        let sweep = self.sweep.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((shutdown_tx, handle)) = sweep {
            let _ = shutdown_tx.send(true);
            let abort = handle.abort_handle();
            if time::timeout(Duration::from_secs(5), handle).await.is_err() {
                abort.abort();
            }
        }

        let units: Vec<DeviceSupervisor> =
            self.units.write().await.drain().map(|(_, unit)| unit).collect();
        let count = units.len();
        let stops = futures::future::join_all(units.iter().map(|unit| unit.stop()));
        match time::timeout(self.options.stop_timeout, stops).await {
            Ok(results) => {
                for (unit, result) in units.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(device_id = %unit.device_id(), error = %e, "Failed to stop device");
                    }
                }
            }
            Err(_) => self.journal.log(
                MANAGER_ID,
                LogLevel::Warn,
                format!(
                    "Timed out after {:?} stopping {} devices",
                    self.options.stop_timeout, count
                ),
            ),
        }

        self.journal
            .log(MANAGER_ID, LogLevel::Info, format!("Fleet stopped ({} devices)", count));
        Ok(())
    }

    /// Adds a device to `group_name`, persists the fleet document and, when
    /// the fleet is running, starts the device.
    pub async fn add_device(&self, group_name: &str, device: DeviceInfo) -> Result<()> {
        let group = {
            let mut guard = self.config.write().await;
            let config = guard
                .as_mut()
                .ok_or_else(|| SupervisorError::Invalid("fleet configuration is not loaded".into()))?;
            config.add_device(group_name, device.clone())?;
            if let Err(e) = config.validate() {
                let _ = config.remove_device(&device.device_id);
                return Err(e);
            }
            config.save(&self.config_path)?;
            config.group(group_name).cloned()
        };

        self.journal.log(
            &device.device_id,
            LogLevel::Info,
            format!("Added to group '{}'", group_name),
        );

        if let Some(group) = group {
            if self.is_running() && group.enabled && device.enabled {
                self.launch_device(&group, &device).await?;
            }
        }
        Ok(())
    }

    /// Stops a device, removes it from the fleet document and persists it.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let unit = self.units.write().await.remove(device_id);
        if let Some(unit) = unit {
            unit.stop().await?;
        }

        let mut guard = self.config.write().await;
        let config = guard
            .as_mut()
            .ok_or_else(|| SupervisorError::NotFound(device_id.to_string()))?;
        config.remove_device(device_id)?;
        config.save(&self.config_path)?;
        drop(guard);

        self.journal
            .log(device_id, LogLevel::Info, "Removed from fleet".to_string());
        Ok(())
    }

    /// Starts a known unit again, or a configured device not yet supervised.
    pub async fn start_device(&self, device_id: &str) -> Result<()> {
        if let Some(unit) = self.unit(device_id).await {
            return unit.start();
        }
        let (group, device) = {
            let config = self.config.read().await;
            let (group, device) = config
                .as_ref()
                .and_then(|c| c.device_by_id(device_id))
                .ok_or_else(|| SupervisorError::NotFound(device_id.to_string()))?;
            (group.clone(), device.clone())
        };
        self.launch_device(&group, &device).await
    }

    /// Stops a device and drops it from supervision.
    pub async fn stop_device(&self, device_id: &str) -> Result<()> {
        let unit = self
            .units
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| SupervisorError::NotFound(device_id.to_string()))?;
        unit.stop().await?;
        self.journal
            .emit(FleetEvent::new(device_id, FleetEventKind::Stop, "stopped by request"));
        Ok(())
    }

    pub async fn restart_device(&self, device_id: &str) -> Result<()> {
        let unit = self
            .unit(device_id)
            .await
            .ok_or_else(|| SupervisorError::NotFound(device_id.to_string()))?;
        unit.restart().await
    }

    pub async fn device_status(&self, device_id: &str) -> Result<UnitStatus> {
        self.unit(device_id)
            .await
            .map(|u| u.status())
            .ok_or_else(|| SupervisorError::NotFound(device_id.to_string()))
    }

    pub async fn device_stats(&self, device_id: &str) -> Result<UnitStats> {
        self.unit(device_id)
            .await
            .map(|u| u.stats())
            .ok_or_else(|| SupervisorError::NotFound(device_id.to_string()))
    }

    pub async fn unit(&self, device_id: &str) -> Option<DeviceSupervisor> {
        self.units.read().await.get(device_id).cloned()
    }

    pub async fn units(&self) -> Vec<DeviceSupervisor> {
        self.units.read().await.values().cloned().collect()
    }

    /// Counts across the fleet. `total_devices` is the configured count.
    pub async fn fleet_stats(&self) -> FleetStats {
        let devices: BTreeMap<String, UnitStats> = self
            .units
            .read()
            .await
            .iter()
            .map(|(id, unit)| (id.clone(), unit.stats()))
            .collect();
        let total_devices = match self.config.read().await.as_ref() {
            Some(config) => config.device_count(),
            None => devices.len(),
        };
        let count = |status: UnitStatus| devices.values().filter(|s| s.status == status).count();

        FleetStats {
            total_devices,
            running_devices: count(UnitStatus::Running),
            error_devices: count(UnitStatus::Error),
            start_time: *self.started_at.lock().unwrap_or_else(|e| e.into_inner()),
            last_update: Utc::now(),
            dropped_logs: self.journal.logs().dropped(),
            dropped_events: self.journal.events().dropped(),
            devices,
        }
    }

    /// Newest first. `device_id` of `None` means every device; `limit` 0
    /// means no limit.
    pub fn logs(&self, device_id: Option<&str>, limit: usize) -> Vec<LogEntry> {
        self.journal.logs().query(device_id, limit)
    }

    /// The lifecycle event stream. Only the first subscriber gets it.
    pub fn subscribe_events(&self) -> Option<mpsc::Receiver<FleetEvent>> {
        self.journal.events().take_receiver()
    }

    /// Runs one health sweep now.
    pub async fn sweep_once(&self) -> SweepReport {
        sweep_units(&self.units, &self.journal).await
    }
}

/// Periodic health sweep; the initial check happens on the first tick
/// after `every`.
async fn run_health_sweep(
    units: UnitMap,
    journal: Arc<Journal>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval(every.max(Duration::from_millis(1)));
    interval.tick().await; // consume immediate first tick, devices were just started

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = sweep_units(&units, &journal).await;
                debug!(checked = report.checked, stale = report.stale, restarted = report.restarted, "Health sweep");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn sweep_units(units: &UnitMap, journal: &Arc<Journal>) -> SweepReport {
    let snapshot: Vec<DeviceSupervisor> = units.read().await.values().cloned().collect();
    let mut report = SweepReport {
        checked: snapshot.len(),
        ..SweepReport::default()
    };

    for unit in snapshot {
        if unit.status() == UnitStatus::Running && !unit.is_healthy() && unit.mark_stale() {
            report.stale += 1;
        }
        if unit.should_restart() {
            report.restarted += 1;
            journal.log(
                unit.device_id(),
                LogLevel::Warn,
                "Unhealthy, scheduling restart".to_string(),
            );
            tokio::spawn(async move {
                if let Err(e) = unit.restart().await {
                    warn!(device_id = %unit.device_id(), error = %e, "Restart failed");
                }
            });
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{fast_policy, wait_for, Behavior, FakeLauncher};
    use crate::runners::InProcessLauncher;
    use crate::testing::{device, fleet, write_template, RULES};

    fn options() -> FleetOptions {
        FleetOptions {
            sweep_interval: Duration::from_secs(3600),
            stop_timeout: Duration::from_secs(2),
            policy: fast_policy(),
            ..FleetOptions::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config_path: PathBuf,
        template_dir: PathBuf,
    }

    fn fixture(ids: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("configs").join("devices.json");
        let template_dir = dir.path().join("templates");
        write_template(&template_dir, RULES);
        fleet(ids).save(&config_path).unwrap();
        Fixture {
            _dir: dir,
            config_path,
            template_dir,
        }
    }

    fn supervisor(fx: &Fixture, launcher: Arc<dyn UnitLauncher>) -> FleetSupervisor {
        FleetSupervisor::new(&fx.config_path, &fx.template_dir, launcher, options())
    }

    async fn wait_all(fleet: &FleetSupervisor, status: UnitStatus) {
        for unit in fleet.units().await {
            wait_for(&unit, status).await;
        }
    }

    #[tokio::test]
    async fn test_start_runs_enabled_devices_in_process() {
        let fx = fixture(&["b1", "b2"]);
        let fleet = supervisor(&fx, Arc::new(InProcessLauncher::new()));

        assert_eq!(fleet.start().await.unwrap(), 2);
        assert!(matches!(fleet.start().await, Err(SupervisorError::FleetRunning)));
        wait_all(&fleet, UnitStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = fleet.fleet_stats().await;
        assert_eq!(stats.total_devices, 2);
        assert_eq!(stats.running_devices, 2);
        assert_eq!(stats.error_devices, 0);
        assert!(stats.start_time.is_some());
        let b1 = &stats.devices["b1"];
        assert_eq!(b1.runtime.as_ref().unwrap().property_updates, 1);

        fleet.stop().await.unwrap();
        assert!(!fleet.is_running());
        assert!(fleet.units().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_start_failure_does_not_abort() {
        let fx = fixture(&["good", "bad"]);
        let mut config = MultiDeviceConfig::load(&fx.config_path).unwrap();
        config.device_groups.push(DeviceGroup {
            group_name: "orphans".into(),
            product_type: "pump".into(),
            devices: vec![device("orphan")],
            template: "pump".into(),
            enabled: true,
            max_instances: 0,
        });
        config.save(&fx.config_path).unwrap();

        let fleet = supervisor(&fx, Arc::new(InProcessLauncher::new()));
        assert_eq!(fleet.start().await.unwrap(), 2);
        let logs = fleet.logs(Some("orphan"), 0);
        assert!(logs[0].message.contains("template 'pump' not found"));
        fleet.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_on_invalid_config() {
        let fx = fixture(&[]);
        std::fs::write(&fx.config_path, r#"{"device_groups": []}"#).unwrap();
        let fleet = supervisor(&fx, Arc::new(InProcessLauncher::new()));
        assert!(fleet.start().await.is_err());
        assert!(!fleet.is_running());
    }

    #[tokio::test]
    async fn test_add_and_remove_device_persist() {
        let fx = fixture(&["b1"]);
        let fleet = supervisor(&fx, FakeLauncher::new(Behavior::Run));
        fleet.start().await.unwrap();

        fleet.add_device("boilers", device("b2")).await.unwrap();
        wait_for(&fleet.unit("b2").await.unwrap(), UnitStatus::Running).await;
        assert!(MultiDeviceConfig::load(&fx.config_path)
            .unwrap()
            .device_by_id("b2")
            .is_some());

        assert!(matches!(
            fleet.add_device("boilers", device("b2")).await,
            Err(SupervisorError::AlreadyExists(_))
        ));
        assert!(matches!(
            fleet.add_device("pumps", device("p1")).await,
            Err(SupervisorError::GroupNotFound(_))
        ));
        let mut incomplete = device("b3");
        incomplete.device_secret.clear();
        assert!(fleet.add_device("boilers", incomplete).await.is_err());
        assert!(fleet.config().await.unwrap().device_by_id("b3").is_none());

        fleet.remove_device("b2").await.unwrap();
        assert!(fleet.unit("b2").await.is_none());
        assert!(MultiDeviceConfig::load(&fx.config_path)
            .unwrap()
            .device_by_id("b2")
            .is_none());
        assert!(matches!(
            fleet.remove_device("b2").await,
            Err(SupervisorError::NotFound(_))
        ));
        fleet.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_device_operations() {
        let fx = fixture(&["b1"]);
        let fleet = supervisor(&fx, FakeLauncher::new(Behavior::Run));
        let mut events = fleet.subscribe_events().unwrap();
        assert!(fleet.subscribe_events().is_none());
        fleet.start().await.unwrap();
        wait_all(&fleet, UnitStatus::Running).await;

        assert!(matches!(
            fleet.start_device("b1").await,
            Err(SupervisorError::AlreadyRunning(_))
        ));
        assert_eq!(fleet.device_status("b1").await.unwrap(), UnitStatus::Running);

        fleet.restart_device("b1").await.unwrap();
        wait_all(&fleet, UnitStatus::Running).await;
        assert_eq!(fleet.device_stats("b1").await.unwrap().restart_count, 1);

        fleet.stop_device("b1").await.unwrap();
        assert!(matches!(
            fleet.device_status("b1").await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            fleet.stop_device("b1").await,
            Err(SupervisorError::NotFound(_))
        ));

        fleet.start_device("b1").await.unwrap();
        wait_all(&fleet, UnitStatus::Running).await;
        assert!(matches!(
            fleet.start_device("ghost").await,
            Err(SupervisorError::NotFound(_))
        ));
        fleet.stop().await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&FleetEventKind::Restart));
        assert!(kinds.contains(&FleetEventKind::Stop));
    }

    #[tokio::test]
    async fn test_sweep_restarts_crashed_units() {
        let fx = fixture(&["b1"]);
        let launcher = FakeLauncher::scripted(
            vec![Behavior::CrashAfter(Duration::from_millis(10))],
            Behavior::Run,
        );
        let fleet = supervisor(&fx, launcher.clone());
        fleet.start().await.unwrap();
        wait_all(&fleet, UnitStatus::Error).await;

        let report = fleet.sweep_once().await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.restarted, 1);
        wait_all(&fleet, UnitStatus::Running).await;
        assert_eq!(fleet.fleet_stats().await.devices["b1"].restart_count, 1);

        let report = fleet.sweep_once().await;
        assert_eq!(report.restarted, 0);
        fleet.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_leaves_exhausted_units_in_error() {
        let fx = fixture(&["b1"]);
        let fleet = supervisor(&fx, FakeLauncher::new(Behavior::CrashAfter(Duration::from_millis(5))));
        fleet.start().await.unwrap();

        for round in 1..=2 {
            wait_all(&fleet, UnitStatus::Error).await;
            assert_eq!(fleet.sweep_once().await.restarted, 1);
            let unit = fleet.unit("b1").await.unwrap();
            while unit.stats().restart_count < round || unit.status() != UnitStatus::Error {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        assert_eq!(fleet.sweep_once().await.restarted, 0);

        let stats = fleet.fleet_stats().await;
        assert_eq!(stats.error_devices, 1);
        assert_eq!(stats.devices["b1"].restart_count, 2);
        fleet.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_keeps_existing_supervisor() {
        let fx = fixture(&["b1"]);
        let launcher = FakeLauncher::new(Behavior::Run);
        let fleet = supervisor(&fx, launcher.clone());
        fleet.start().await.unwrap();
        wait_all(&fleet, UnitStatus::Running).await;
        let before = fleet.device_stats("b1").await.unwrap().instance_id;

        let config = fleet.config().await.unwrap();
        let (group, device) = config.device_by_id("b1").unwrap();
        assert!(matches!(
            fleet.launch_device(group, device).await,
            Err(SupervisorError::AlreadyRunning(_))
        ));

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(fleet.device_stats("b1").await.unwrap().instance_id, before);
        assert_eq!(fleet.units().await.len(), 1);
        fleet.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_logs_newest_first() {
        let fx = fixture(&["b1"]);
        let fleet = supervisor(&fx, FakeLauncher::new(Behavior::Run));
        fleet.start().await.unwrap();
        wait_all(&fleet, UnitStatus::Running).await;

        let logs = fleet.logs(Some("b1"), 0);
        assert_eq!(logs.len(), 2);
        assert!(logs[0].message.contains("running"));
        assert!(logs[1].message.contains("starting"));
        assert_eq!(fleet.logs(None, 1).len(), 1);
        fleet.stop().await.unwrap();
    }
}
