use crate::error::{Result, SupervisorError};
use crate::journal::{FleetEvent, FleetEventKind, Journal, LogLevel};
use crate::launcher::{LaunchedUnit, UnitLauncher, UnitProbe, UnitSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thingsim::SimError;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// Resolves `path` against the current directory. Workers run with the work
/// dir as their cwd, so every path handed to them must be absolute.
fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Runs each device as a `thingsim --mode simulator` worker process.
pub struct ProcessLauncher {
    executable: PathBuf,
    work_dir: PathBuf,
}

impl ProcessLauncher {
    /// A bare executable name is left for a `PATH` lookup; anything with a
    /// directory part is made absolute, as is `work_dir`.
    pub fn new(executable: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        let executable = executable.into();
        let executable = if executable.components().count() > 1 {
            absolute(&executable)
        } else {
            executable
        };
        Self {
            executable,
            work_dir: absolute(&work_dir.into()),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn config_file(&self, device_id: &str) -> PathBuf {
        self.work_dir
            .join("configs")
            .join("processes")
            .join(format!("{}.json", device_id))
    }

    pub fn log_file(&self, device_id: &str) -> PathBuf {
        self.work_dir.join("logs").join(format!("{}.log", device_id))
    }

    /// Arguments passed to the worker for `spec`.
    pub fn args(&self, spec: &UnitSpec) -> Vec<String> {
        vec![
            "--mode".to_string(),
            "simulator".to_string(),
            "--tsl".to_string(),
            absolute(&spec.model_file).display().to_string(),
            "--rule".to_string(),
            absolute(&spec.rule_file).display().to_string(),
            "--config".to_string(),
            self.config_file(&spec.device_id).display().to_string(),
        ]
    }

    /// The full command line, for display.
    pub fn command_line(&self, spec: &UnitSpec) -> String {
        std::iter::once(self.executable.display().to_string())
            .chain(self.args(spec))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl UnitLauncher for ProcessLauncher {
    async fn launch(&self, spec: &UnitSpec, journal: Arc<Journal>) -> Result<Box<dyn LaunchedUnit>> {
        let config_file = self.config_file(&spec.device_id);
        spec.config
            .save(&config_file)
            .map_err(|source| SupervisorError::Launch {
                device_id: spec.device_id.clone(),
                source,
            })?;

        let log_file = self.log_file(&spec.device_id);
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SupervisorError::Launch {
                device_id: spec.device_id.clone(),
                source: SimError::config(parent, e),
            })?;
        }

        let mut child = Command::new(&self.executable)
            .args(self.args(spec))
            .current_dir(&self.work_dir)
            .env("DEVICE_ID", &spec.device_id)
            .env("LOG_FILE", &log_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                device_id: spec.device_id.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        let probe = Arc::new(ProcessProbe {
            pid,
            last_output: RwLock::new(Some(Utc::now())),
        });

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(monitor_output(
                stdout,
                LogLevel::Info,
                spec.device_id.clone(),
                probe.clone(),
                journal.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(monitor_output(
                stderr,
                LogLevel::Warn,
                spec.device_id.clone(),
                probe.clone(),
                journal.clone(),
            ));
        }

        journal.log(
            &spec.device_id,
            LogLevel::Info,
            format!("Worker process started (pid {})", pid.unwrap_or_default()),
        );

        Ok(Box::new(ProcessUnit {
            device_id: spec.device_id.clone(),
            child,
            probe,
        }))
    }

    fn kind(&self) -> &'static str {
        "process"
    }
}

struct ProcessProbe {
    pid: Option<u32>,
    last_output: RwLock<Option<DateTime<Utc>>>,
}

impl ProcessProbe {
    fn touch(&self) {
        *self.last_output.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }
}

impl UnitProbe for ProcessProbe {
    fn last_activity(&self) -> Option<DateTime<Utc>> {
        *self.last_output.read().unwrap_or_else(|e| e.into_inner())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Forwards each output line to the journal until the pipe closes.
async fn monitor_output<R>(
    reader: R,
    level: LogLevel,
    device_id: String,
    probe: Arc<ProcessProbe>,
    journal: Arc<Journal>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = LinesStream::new(BufReader::new(reader).lines());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Failed to read worker output");
                break;
            }
        };
        probe.touch();
        debug!(device_id = %device_id, pid = ?probe.pid, "{}", line);
        journal.record(&device_id, level, line.clone());
        journal.emit(FleetEvent::new(&device_id, FleetEventKind::Output, line).with_pid(probe.pid));
    }
}

struct ProcessUnit {
    device_id: String,
    child: Child,
    probe: Arc<ProcessProbe>,
}

impl ProcessUnit {
    /// Sends SIGTERM where available, otherwise kills outright.
    fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => return,
                Err(e) => warn!(device_id = %self.device_id, pid, error = %e, "SIGTERM failed"),
            }
        }
        if let Err(e) = self.child.start_kill() {
            warn!(device_id = %self.device_id, error = %e, "Failed to kill worker process");
        }
    }
}

#[async_trait]
impl LaunchedUnit for ProcessUnit {
    fn probe(&self) -> Arc<dyn UnitProbe> {
        self.probe.clone()
    }

    async fn exited(&mut self) -> std::result::Result<(), String> {
        match self.child.wait().await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(format!("process exited with {}", status)),
            Err(e) => Err(format!("failed to wait for process: {}", e)),
        }
    }

    async fn shutdown(&mut self, grace: Duration) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        self.terminate();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(device_id = %self.device_id, %status, "Worker process stopped");
            }
            Ok(Err(e)) => warn!(device_id = %self.device_id, error = %e, "Failed to wait for worker process"),
            Err(_) => {
                warn!(device_id = %self.device_id, "Worker ignored termination, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(device_id = %self.device_id, error = %e, "Failed to kill worker process");
                }
            }
        }
    }
}
