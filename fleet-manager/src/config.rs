use crate::device::SupervisorPolicy;
use crate::journal::{DEFAULT_EVENT_CAPACITY, DEFAULT_LOG_CAPACITY};
use crate::manager::FleetOptions;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete fleet manager settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// In-process fleet supervision
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// How often every unit is health-checked (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Bound on stopping the whole fleet (seconds)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// A unit without a heartbeat for this long is unhealthy (seconds)
    #[serde(default = "default_heartbeat_stale")]
    pub heartbeat_stale_secs: u64,
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_stop_grace() -> u64 {
    30
}

fn default_restart_backoff() -> u64 {
    2
}

fn default_max_restarts() -> u32 {
    5
}

fn default_heartbeat_stale() -> u64 {
    300
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            stop_timeout_secs: default_stop_timeout(),
            log_capacity: default_log_capacity(),
            event_capacity: default_event_capacity(),
            stop_grace_secs: default_stop_grace(),
            restart_backoff_secs: default_restart_backoff(),
            max_restarts: default_max_restarts(),
            heartbeat_stale_secs: default_heartbeat_stale(),
        }
    }
}

/// Worker-process fleet supervision
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Worker binary; defaults to `thingsim` next to this executable
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Root for generated configs and worker logs
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_process_sweep")]
    pub sweep_interval_secs: u64,
    /// A worker silent for this long is unhealthy (seconds)
    #[serde(default = "default_output_stale")]
    pub output_stale_secs: u64,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_process_grace")]
    pub stop_grace_secs: u64,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_process_sweep() -> u64 {
    30
}

fn default_output_stale() -> u64 {
    120
}

fn default_restart_delay() -> u64 {
    10
}

fn default_process_grace() -> u64 {
    5
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executable: None,
            work_dir: default_work_dir(),
            sweep_interval_secs: default_process_sweep(),
            output_stale_secs: default_output_stale(),
            restart_delay_secs: default_restart_delay(),
            max_restarts: default_max_restarts(),
            stop_grace_secs: default_process_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_multi_config")]
    pub multi_config: PathBuf,
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
}

fn default_multi_config() -> PathBuf {
    PathBuf::from("configs/devices.json")
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("configs/device_templates")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            multi_config: default_multi_config(),
            template_dir: default_template_dir(),
        }
    }
}

impl ManagerConfig {
    /// Defaults with `FLEET_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`; unparsable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FLEET_MULTI_CONFIG") {
            self.paths.multi_config = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLEET_TEMPLATE_DIR") {
            self.paths.template_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLEET_SWEEP_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.supervisor.sweep_interval_secs = n;
            }
        }
        if let Some(v) = lookup("FLEET_MAX_RESTARTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.supervisor.max_restarts = n;
                self.process.max_restarts = n;
            }
        }
        if let Some(v) = lookup("FLEET_WORKER_EXECUTABLE") {
            self.process.executable = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FLEET_WORK_DIR") {
            self.process.work_dir = PathBuf::from(v);
        }
    }

    /// Options for the in-process fleet.
    pub fn fleet_options(&self) -> FleetOptions {
        let s = &self.supervisor;
        FleetOptions {
            sweep_interval: Duration::from_secs(s.sweep_interval_secs.max(1)),
            stop_timeout: Duration::from_secs(s.stop_timeout_secs),
            log_capacity: s.log_capacity,
            event_capacity: s.event_capacity,
            policy: SupervisorPolicy {
                stop_grace: Duration::from_secs(s.stop_grace_secs),
                restart_backoff: Duration::from_secs(s.restart_backoff_secs),
                max_restarts: s.max_restarts,
                stale_after: Duration::from_secs(s.heartbeat_stale_secs),
                auto_restart: false,
            },
        }
    }

    /// Options for the worker-process fleet. Crashed workers restart on
    /// their own after the restart delay.
    pub fn process_options(&self) -> FleetOptions {
        let p = &self.process;
        FleetOptions {
            sweep_interval: Duration::from_secs(p.sweep_interval_secs.max(1)),
            stop_timeout: Duration::from_secs(self.supervisor.stop_timeout_secs),
            log_capacity: self.supervisor.log_capacity,
            event_capacity: self.supervisor.event_capacity,
            policy: SupervisorPolicy {
                stop_grace: Duration::from_secs(p.stop_grace_secs),
                restart_backoff: Duration::from_secs(p.restart_delay_secs),
                max_restarts: p.max_restarts,
                stale_after: Duration::from_secs(p.output_stale_secs),
                auto_restart: true,
            },
        }
    }
}

/// Load settings from a TOML file, then apply environment overrides.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<ManagerConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let mut config: ManagerConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
    config.apply_env();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.supervisor.sweep_interval_secs, 60);
        assert_eq!(config.supervisor.log_capacity, 10_000);
        assert_eq!(config.supervisor.event_capacity, 100);
        assert_eq!(config.process.restart_delay_secs, 10);
        assert_eq!(config.process.output_stale_secs, 120);
        assert_eq!(config.paths.multi_config, PathBuf::from("configs/devices.json"));

        let options = config.fleet_options();
        assert_eq!(options.policy, SupervisorPolicy::default());
        assert_eq!(options.stop_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [supervisor]
            sweep_interval_secs = 15
            max_restarts = 3

            [process]
            executable = "/opt/thingsim/bin/thingsim"
            work_dir = "/var/lib/fleet"
            restart_delay_secs = 4

            [paths]
            template_dir = "/etc/fleet/templates"
        "#;

        let config: ManagerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.supervisor.sweep_interval_secs, 15);
        assert_eq!(config.supervisor.stop_timeout_secs, 30);
        assert_eq!(
            config.process.executable,
            Some(PathBuf::from("/opt/thingsim/bin/thingsim"))
        );
        assert_eq!(config.paths.multi_config, PathBuf::from("configs/devices.json"));

        let process = config.process_options();
        assert!(process.policy.auto_restart);
        assert_eq!(process.policy.restart_backoff, Duration::from_secs(4));
        assert_eq!(process.policy.stale_after, Duration::from_secs(120));
        assert_eq!(process.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.fleet_options().policy.max_restarts, 3);
    }

    #[test]
    fn test_partial_config() {
        let config: ManagerConfig = toml::from_str("[process]\nstop_grace_secs = 1\n").unwrap();
        assert_eq!(config.process.stop_grace_secs, 1);
        assert_eq!(config.process.sweep_interval_secs, 30);
        assert_eq!(config.supervisor.heartbeat_stale_secs, 300);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FLEET_MAX_RESTARTS", "9"),
            ("FLEET_SWEEP_INTERVAL_SECS", "not-a-number"),
            ("FLEET_WORK_DIR", "/tmp/fleet"),
        ]
        .into_iter()
        .collect();

        let mut config = ManagerConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.supervisor.max_restarts, 9);
        assert_eq!(config.process.max_restarts, 9);
        assert_eq!(config.supervisor.sweep_interval_secs, 60);
        assert_eq!(config.process.work_dir, PathBuf::from("/tmp/fleet"));
    }

    #[test]
    fn test_load_config_reports_path() {
        let err = load_config("/nonexistent/fleet.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fleet.toml"));
    }
}
