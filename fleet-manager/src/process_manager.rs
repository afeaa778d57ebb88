//! Process supervisor - the fleet supervisor with one worker process per
//! device.
//!
//! Control logic is shared with [`FleetSupervisor`]; only the unit differs.
//! Liveness comes from the worker's output, stop is SIGTERM followed by a
//! kill after the grace period, and crashed workers restart on their own
//! after a fixed delay while the restart budget lasts.

use crate::device::UnitStatus;
use crate::error::{Result, SupervisorError};
use crate::launcher::UnitSpec;
use crate::manager::{FleetOptions, FleetStats, FleetSupervisor};
use crate::runners::ProcessLauncher;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-worker view.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub device_id: String,
    pub pid: Option<u32>,
    pub status: UnitStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub last_output: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub config_file: PathBuf,
    pub log_file: PathBuf,
    pub command: String,
}

pub struct ProcessSupervisor {
    fleet: FleetSupervisor,
    launcher: Arc<ProcessLauncher>,
}

impl ProcessSupervisor {
    /// Creates the supervisor and the `configs/processes` and `logs`
    /// directories under the launcher's work dir.
    pub fn new(
        config_path: impl Into<PathBuf>,
        template_dir: impl Into<PathBuf>,
        launcher: ProcessLauncher,
        options: FleetOptions,
    ) -> Result<Self> {
        let launcher = prepare(launcher)?;
        let fleet = FleetSupervisor::new(config_path, template_dir, launcher.clone(), options);
        Ok(Self { fleet, launcher })
    }

    /// A worker fleet with no fleet document; start it with
    /// [`ProcessSupervisor::start_units`].
    pub fn detached(launcher: ProcessLauncher, options: FleetOptions) -> Result<Self> {
        let launcher = prepare(launcher)?;
        let fleet = FleetSupervisor::detached(launcher.clone(), options);
        Ok(Self { fleet, launcher })
    }

    /// The shared control surface: per-device operations, logs and events.
    pub fn fleet(&self) -> &FleetSupervisor {
        &self.fleet
    }

    pub async fn start(&self) -> Result<usize> {
        self.fleet.start().await
    }

    pub async fn start_units(&self, specs: Vec<UnitSpec>) -> Result<usize> {
        self.fleet.start_units(specs).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.fleet.stop().await
    }

    pub async fn fleet_stats(&self) -> FleetStats {
        self.fleet.fleet_stats().await
    }

    pub async fn process_stats(&self) -> BTreeMap<String, ProcessStats> {
        self.fleet
            .units()
            .await
            .into_iter()
            .map(|unit| {
                let stats = unit.stats();
                let spec = unit.spec();
                let process = ProcessStats {
                    device_id: stats.device_id.clone(),
                    pid: stats.pid,
                    status: stats.status,
                    start_time: stats.start_time,
                    last_output: stats.last_heartbeat,
                    restart_count: stats.restart_count,
                    last_error: stats.last_error,
                    config_file: self.launcher.config_file(&spec.device_id),
                    log_file: self.launcher.log_file(&spec.device_id),
                    command: self.launcher.command_line(spec),
                };
                (stats.device_id, process)
            })
            .collect()
    }
}

fn prepare(launcher: ProcessLauncher) -> Result<Arc<ProcessLauncher>> {
    for dir in [
        launcher.work_dir().join("configs").join("processes"),
        launcher.work_dir().join("logs"),
    ] {
        std::fs::create_dir_all(&dir).map_err(|e| SupervisorError::config(&dir, e))?;
    }
    Ok(Arc::new(launcher))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::device::tests::{fast_policy, wait_for};
    use crate::device::SupervisorPolicy;
    use crate::testing::{fleet, write_template, RULES};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn worker(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn process_supervisor(dir: &std::path::Path, body: &str, policy: SupervisorPolicy) -> ProcessSupervisor {
        let config_path = dir.join("devices.json");
        let template_dir = dir.join("templates");
        write_template(&template_dir, RULES);
        fleet(&["w1"]).save(&config_path).unwrap();

        let launcher = ProcessLauncher::new(worker(dir, body), dir.join("work"));
        let options = FleetOptions {
            sweep_interval: Duration::from_secs(3600),
            stop_timeout: Duration::from_secs(5),
            policy,
            ..FleetOptions::default()
        };
        ProcessSupervisor::new(config_path, template_dir, launcher, options).unwrap()
    }

    #[tokio::test]
    async fn test_workers_start_and_report_stats() {
        let dir = tempfile::tempdir().unwrap();
        let sup = process_supervisor(dir.path(), "echo up\nexec sleep 30", fast_policy());
        assert!(dir.path().join("work/logs").is_dir());

        assert_eq!(sup.start().await.unwrap(), 1);
        let unit = sup.fleet().unit("w1").await.unwrap();
        wait_for(&unit, UnitStatus::Running).await;

        let stats = sup.process_stats().await;
        let w1 = &stats["w1"];
        assert!(w1.pid.is_some());
        assert!(w1.config_file.ends_with("configs/processes/w1.json"));
        assert!(w1.config_file.exists());
        assert!(w1.command.contains("--mode simulator"));
        assert!(unit.is_healthy());

        sup.stop().await.unwrap();
        assert!(sup.process_stats().await.is_empty());
    }

    #[tokio::test]
    async fn test_device_dirs_run_as_workers() {
        use crate::device_dirs::tests::{write_device_dir, ALL};
        use crate::device_dirs::unit_specs;

        let dir = tempfile::tempdir().unwrap();
        let devices = dir.path().join("devices");
        write_device_dir(&devices, "device1", ALL);
        write_device_dir(&devices, "device2", &ALL[..2]);

        let launcher = ProcessLauncher::new(worker(dir.path(), "echo up\nexec sleep 30"), dir.path().join("work"));
        let options = FleetOptions {
            sweep_interval: Duration::from_secs(3600),
            stop_timeout: Duration::from_secs(5),
            policy: fast_policy(),
            ..FleetOptions::default()
        };
        let sup = ProcessSupervisor::detached(launcher, options).unwrap();
        assert!(sup.start().await.is_err());

        assert_eq!(sup.start_units(unit_specs(&devices).unwrap()).await.unwrap(), 1);
        let unit = sup.fleet().unit("device1").await.unwrap();
        wait_for(&unit, UnitStatus::Running).await;

        let stats = sup.process_stats().await;
        assert_eq!(stats.len(), 1);
        assert!(stats["device1"].command.contains("device1/tsl.json"));
        assert!(stats["device1"].config_file.exists());

        sup.stop().await.unwrap();
        assert!(sup.process_stats().await.is_empty());
    }

    #[tokio::test]
    async fn test_crashing_worker_restarts_until_budget() {
        let dir = tempfile::tempdir().unwrap();
        let policy = SupervisorPolicy {
            auto_restart: true,
            ..fast_policy()
        };
        let sup = process_supervisor(dir.path(), "echo boom\nexit 3", policy);
        sup.start().await.unwrap();
        let unit = sup.fleet().unit("w1").await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while unit.stats().restart_count < 2 || unit.status() != UnitStatus::Error {
            assert!(std::time::Instant::now() < deadline, "worker never settled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = unit.stats();
        assert_eq!(stats.status, UnitStatus::Error);
        assert_eq!(stats.restart_count, 2);
        assert!(stats.last_error.unwrap().contains("exit"));
        assert!(!unit.should_restart());

        let output = sup.fleet().logs(Some("w1"), 0);
        assert!(output.iter().any(|e| e.message == "boom"));
        sup.stop().await.unwrap();
    }
}
