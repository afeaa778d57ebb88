use crate::error::{Result, SupervisorError};
use crate::journal::{Journal, LogLevel};
use crate::launcher::{LaunchedUnit, UnitLauncher, UnitProbe, UnitSpec};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thingsim::framework::{DeviceFramework, LoopbackFramework};
use thingsim::runtime::SimulatedDevice;
use thingsim::SimError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

pub type FrameworkFactory = Arc<dyn Fn(&UnitSpec) -> Arc<dyn DeviceFramework> + Send + Sync>;

/// Runs each device as a [`SimulatedDevice`] task in this process.
pub struct InProcessLauncher {
    frameworks: FrameworkFactory,
}

impl Default for InProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self {
            frameworks: Arc::new(|_| Arc::new(LoopbackFramework::new()) as Arc<dyn DeviceFramework>),
        }
    }

    /// Supplies the framework each launched device talks to.
    pub fn with_framework_factory(mut self, factory: FrameworkFactory) -> Self {
        self.frameworks = factory;
        self
    }
}

#[async_trait]
impl UnitLauncher for InProcessLauncher {
    async fn launch(&self, spec: &UnitSpec, journal: Arc<Journal>) -> Result<Box<dyn LaunchedUnit>> {
        let launch_err = |source: SimError| SupervisorError::Launch {
            device_id: spec.device_id.clone(),
            source,
        };

        let framework = (self.frameworks)(spec);
        let device = Arc::new(
            SimulatedDevice::from_files(spec.identity(), &spec.model_file, &spec.rule_file, framework.clone())
                .map_err(launch_err)?
                .with_options(spec.runtime_options()),
        );
        device.initialize().map_err(launch_err)?;
        framework.start().await.map_err(|e| {
            launch_err(SimError::Registration {
                identifier: spec.device_id.clone(),
                reason: e.to_string(),
            })
        })?;

        journal.log(
            &spec.device_id,
            LogLevel::Info,
            format!(
                "Simulated device launched ({} properties, every {}s)",
                device.model().properties.len(),
                spec.upload_interval().as_secs()
            ),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(device.clone().run(shutdown_rx));

        Ok(Box::new(InProcessUnit {
            device,
            framework,
            shutdown_tx,
            handle: Some(handle),
        }))
    }

    fn kind(&self) -> &'static str {
        "in-process"
    }
}

struct InProcessUnit {
    device: Arc<SimulatedDevice>,
    framework: Arc<dyn DeviceFramework>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<thingsim::Result<()>>>,
}

fn describe_join(result: std::result::Result<thingsim::Result<()>, tokio::task::JoinError>) -> std::result::Result<(), String> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("runtime panicked: {}", message))
        }
        Err(e) => Err(format!("runtime task cancelled: {}", e)),
    }
}

#[async_trait]
impl LaunchedUnit for InProcessUnit {
    fn probe(&self) -> Arc<dyn UnitProbe> {
        Arc::new(self.device.stats())
    }

    async fn exited(&mut self) -> std::result::Result<(), String> {
        let Some(handle) = self.handle.as_mut() else {
            return futures::future::pending().await;
        };
        let finished = tokio::select! {
            result = handle => Some(result),
            _ = self.framework.wait_for_shutdown() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                // Transport asked the device to go away; wind it down cleanly.
                let _ = self.shutdown_tx.send(true);
                match self.handle.as_mut() {
                    Some(handle) => handle.await,
                    None => return Ok(()),
                }
            }
        };
        self.handle = None;
        describe_join(result)
    }

    async fn shutdown(&mut self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        if let Some(mut handle) = self.handle.take() {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(result) => {
                    if let Err(e) = describe_join(result) {
                        warn!(device_id = %self.device.identity().device_id, error = %e, "Runtime ended with error during shutdown");
                    }
                }
                Err(_) => {
                    warn!(device_id = %self.device.identity().device_id, "Runtime did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        if let Err(e) = self.framework.stop().await {
            warn!(device_id = %self.device.identity().device_id, error = %e, "Framework stop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_template, RULES};

    fn spec(dir: &std::path::Path, rules: &str) -> UnitSpec {
        let template = write_template(dir, rules);
        let mut config = thingsim::config::DeviceConfig::default();
        config.device.product_key = "pk".into();
        config.device.device_name = "b1".into();
        config.simulation.heartbeat_interval_secs = 1;
        UnitSpec {
            device_id: "b1".into(),
            group: "boilers".into(),
            product_type: "boiler".into(),
            model_file: template.join("tsl.json"),
            rule_file: template.join("rule.json"),
            config,
        }
    }

    fn shared(framework: &Arc<LoopbackFramework>) -> InProcessLauncher {
        let framework = framework.clone();
        InProcessLauncher::new()
            .with_framework_factory(Arc::new(move |_| framework.clone() as Arc<dyn DeviceFramework>))
    }

    #[tokio::test]
    async fn test_launch_reports_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let framework = Arc::new(LoopbackFramework::new());
        let journal = Arc::new(Journal::default());

        let mut unit = shared(&framework)
            .launch(&spec(dir.path(), RULES), journal.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(framework.identity().unwrap().device_id, "b1");
        assert!(framework.report_count() >= 1);
        let probe = unit.probe();
        assert!(probe.last_activity().is_some());
        assert_eq!(probe.stats().unwrap().property_updates, 1);
        assert_eq!(journal.logs().query(Some("b1"), 0).len(), 1);

        unit.shutdown(Duration::from_secs(1)).await;
        assert!(!framework.is_started());
    }

    #[tokio::test]
    async fn test_launch_rejects_inconsistent_rules() {
        let dir = tempfile::tempdir().unwrap();
        let rules = RULES.replace("temperature", "pressure");
        let err = match InProcessLauncher::new()
            .launch(&spec(dir.path(), &rules), Arc::new(Journal::default()))
            .await
        {
            Ok(_) => panic!("launch should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, SupervisorError::Launch { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_framework_shutdown_ends_unit_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let framework = Arc::new(LoopbackFramework::new());

        let mut unit = shared(&framework)
            .launch(&spec(dir.path(), RULES), Arc::new(Journal::default()))
            .await
            .unwrap();
        framework.request_shutdown();
        let exited = tokio::time::timeout(Duration::from_secs(1), unit.exited())
            .await
            .unwrap();
        assert_eq!(exited, Ok(()));
    }

    #[tokio::test]
    async fn test_registration_rejection_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let framework = Arc::new(LoopbackFramework::new());
        framework.set_reject_registrations(true);

        let err = match shared(&framework)
            .launch(&spec(dir.path(), RULES), Arc::new(Journal::default()))
            .await
        {
            Ok(_) => panic!("launch should fail"),
            Err(e) => e,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_describe_join_reports_runtime_errors() {
        let err = describe_join(Ok(Err(SimError::Crash("boom".into())))).unwrap_err();
        assert!(err.contains("boom"));
        assert_eq!(describe_join(Ok(Ok(()))), Ok(()));
    }
}
