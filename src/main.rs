use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use thingsim::config::DeviceConfig;
use thingsim::framework::{DeviceFramework, LoopbackFramework};
use thingsim::model::{product_from_model_file, ThingModel};
use thingsim::rulegen::{generator_for, persist_rule, LlmConfig};
use thingsim::rules::product_files;
use thingsim::runtime::SimulatedDevice;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Run one simulated device
    Simulator,
    /// Write a rule file for a thing model
    GenerateRule,
}

#[derive(Debug, Parser)]
#[command(name = "thingsim", about = "Simulated IoT device worker")]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Simulator)]
    mode: Mode,

    /// Thing model file
    #[arg(long)]
    tsl: Option<PathBuf>,

    /// Rule file
    #[arg(long)]
    rule: Option<PathBuf>,

    /// Device config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Product name, resolved to tsl_<product>.json and rule_<product>.json under --dir
    #[arg(long)]
    product: Option<String>,

    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Output directory for generated rules (defaults to the model's directory)
    #[arg(long)]
    out: Option<PathBuf>,

    /// Generate rules through the LLM backend configured by LLM_* variables
    #[arg(long)]
    llm: bool,
}

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "thingsim=info".into());

    let file_layer = match std::env::var("LOG_FILE").ok().filter(|p| !p.is_empty()) {
        Some(path) => {
            let path = PathBuf::from(path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory for {}", path.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;

    match args.mode {
        Mode::Simulator => run_simulator(args).await,
        Mode::GenerateRule => generate_rule(args).await,
    }
}

fn resolve_files(args: &Args) -> Result<(PathBuf, PathBuf)> {
    match (&args.tsl, &args.rule, &args.product) {
        (Some(tsl), Some(rule), _) => Ok((tsl.clone(), rule.clone())),
        (tsl, rule, Some(product)) => {
            let (default_tsl, default_rule) = product_files(&args.dir, product);
            Ok((
                tsl.clone().unwrap_or(default_tsl),
                rule.clone().unwrap_or(default_rule),
            ))
        }
        _ => bail!("--tsl and --rule, or --product, are required in simulator mode"),
    }
}

async fn run_simulator(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => DeviceConfig::load(path)?,
        None => DeviceConfig::from_env(),
    };
    let (tsl, rule) = resolve_files(&args)?;

    let device_id = std::env::var("DEVICE_ID").ok();
    let identity = config.identity(device_id.as_deref());

    info!(
        device_id = %identity.device_id,
        tsl = %tsl.display(),
        rule = %rule.display(),
        mqtt_host = %config.mqtt.host,
        "Simulator starting"
    );

    let framework = Arc::new(LoopbackFramework::new());
    let device = Arc::new(
        SimulatedDevice::from_files(identity, &tsl, &rule, framework.clone())
            .context("Failed to build simulated device")?
            .with_options(config.runtime_options()),
    );
    device.initialize().context("Failed to initialize simulated device")?;
    framework.start().await.context("Failed to start framework")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut run = tokio::spawn(device.clone().run(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = framework.wait_for_shutdown() => info!("Framework requested shutdown"),
        result = &mut run => {
            // The loop only returns on its own when it failed to start
            result.context("Device task panicked")??;
            bail!("Device stopped unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    run.await.context("Device task panicked")??;
    if let Err(e) = framework.stop().await {
        warn!(error = %e, "Framework stop failed");
    }

    let stats = device.stats().snapshot();
    info!(
        property_updates = stats.property_updates,
        event_triggers = stats.event_triggers,
        service_calls = stats.service_calls,
        errors = stats.errors,
        "Simulator stopped"
    );
    Ok(())
}

async fn generate_rule(args: Args) -> Result<()> {
    let tsl = args
        .tsl
        .clone()
        .context("--tsl is required in generate-rule mode")?;
    let text = std::fs::read_to_string(&tsl)
        .with_context(|| format!("Failed to read {}", tsl.display()))?;
    let model = ThingModel::load(&tsl)?;

    let product = match args.product.clone().or_else(|| product_from_model_file(&tsl)) {
        Some(p) => p,
        None => bail!("--product is required when the model file is not named tsl_<product>.json"),
    };

    let llm = if args.llm {
        Some(LlmConfig::from_env().context("--llm needs LLM_API_KEY (and LLM_BASE_URL/LLM_MODEL for non-default providers)")?)
    } else {
        None
    };
    let generator = generator_for(llm)?;
    let rules = generator.generate(&product, &model, &text).await?;

    let out = args
        .out
        .clone()
        .or_else(|| tsl.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let path = persist_rule(&out, &rules)?;
    info!(product = %product, path = %path.display(), "Rule generated");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
