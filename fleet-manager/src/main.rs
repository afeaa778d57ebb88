use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fleet_manager::config::{load_config, ManagerConfig};
use fleet_manager::device_dirs::unit_specs;
use fleet_manager::{FleetEvent, FleetSupervisor, InProcessLauncher, ProcessLauncher, ProcessSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Simulated devices as tasks in this process
    Multi,
    /// One thingsim worker process per device
    Process,
    /// One worker process per `device*` directory under --device-path
    Simple,
}

#[derive(Debug, Parser)]
#[command(name = "fleet-manager", about = "Supervise a fleet of simulated IoT devices")]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Multi)]
    mode: Mode,

    /// Fleet document (overrides settings)
    #[arg(long)]
    multi_config: Option<PathBuf>,

    /// Device template directory (overrides settings)
    #[arg(long)]
    template_path: Option<PathBuf>,

    /// TOML settings file
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Worker executable for process mode
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Work directory for process and simple modes
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Directory of device* subdirectories for simple mode
    #[arg(long, default_value = "configs")]
    device_path: PathBuf,
}

/// `thingsim` next to this binary, else whatever is on PATH.
fn default_worker() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("thingsim")))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from("thingsim"))
}

/// Drains lifecycle events into the debug log.
fn log_events(events: Option<mpsc::Receiver<FleetEvent>>) {
    if let Some(mut events) = events {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(
                    device_id = %event.device_id,
                    kind = ?event.kind,
                    status = ?event.status,
                    pid = ?event.pid,
                    "{}",
                    event.message
                );
            }
        });
    }
}

fn worker_launcher(settings: &ManagerConfig) -> ProcessLauncher {
    let executable = settings
        .process
        .executable
        .clone()
        .unwrap_or_else(default_worker);
    info!(executable = %executable.display(), work_dir = %settings.process.work_dir.display(), "Using worker processes");
    ProcessLauncher::new(executable, &settings.process.work_dir)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_manager=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => load_config(path)?,
        None => ManagerConfig::from_env(),
    };
    if let Some(path) = args.multi_config.clone() {
        settings.paths.multi_config = path;
    }
    if let Some(path) = args.template_path.clone() {
        settings.paths.template_dir = path;
    }
    if let Some(exe) = args.executable.clone() {
        settings.process.executable = Some(exe);
    }
    if let Some(dir) = args.work_dir.clone() {
        settings.process.work_dir = dir;
    }

    info!(
        mode = ?args.mode,
        multi_config = %settings.paths.multi_config.display(),
        template_dir = %settings.paths.template_dir.display(),
        "Fleet manager starting"
    );

    match args.mode {
        Mode::Multi => {
            let fleet = FleetSupervisor::new(
                &settings.paths.multi_config,
                &settings.paths.template_dir,
                Arc::new(InProcessLauncher::new()),
                settings.fleet_options(),
            );
            log_events(fleet.subscribe_events());
            let started = fleet.start().await.context("Failed to start fleet")?;
            info!(devices_started = started, "Fleet running");

            wait_for_ctrl_c().await?;
            fleet.stop().await?;
            let stats = fleet.fleet_stats().await;
            info!(total = stats.total_devices, dropped_logs = stats.dropped_logs, "Fleet stopped");
        }
        Mode::Process => {
            let launcher = worker_launcher(&settings);
            let supervisor = ProcessSupervisor::new(
                &settings.paths.multi_config,
                &settings.paths.template_dir,
                launcher,
                settings.process_options(),
            )
            .context("Failed to prepare process supervisor")?;
            log_events(supervisor.fleet().subscribe_events());
            let started = supervisor.start().await.context("Failed to start worker fleet")?;
            info!(workers_started = started, "Worker fleet running");

            wait_for_ctrl_c().await?;
            supervisor.stop().await?;
            info!("Worker fleet stopped");
        }
        Mode::Simple => {
            let specs = unit_specs(&args.device_path).with_context(|| {
                format!("Failed to scan device directories in {}", args.device_path.display())
            })?;
            if specs.is_empty() {
                warn!(device_path = %args.device_path.display(), "No device* directories found");
                return Ok(());
            }

            let supervisor = ProcessSupervisor::detached(worker_launcher(&settings), settings.process_options())
                .context("Failed to prepare process supervisor")?;
            log_events(supervisor.fleet().subscribe_events());
            let started = supervisor
                .start_units(specs)
                .await
                .context("Failed to start device workers")?;
            info!(workers_started = started, "Device workers running");

            wait_for_ctrl_c().await?;
            supervisor.stop().await?;
            info!("Device workers stopped");
        }
    }

    Ok(())
}

async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");
    Ok(())
}
