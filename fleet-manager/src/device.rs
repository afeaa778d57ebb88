//! Lifecycle of one supervised device.
//!
//! ```text
//!   Stopped ──start──▶ Starting ──launched──▶ Running ──exit 0──▶ Stopped
//!      ▲                  │                     │
//!      │               failed                 crash / stale
//!      │                  ▼                     ▼
//!      └──stop── Stopping ◀──────────────── Error ──restart──▶ Restarting ──▶ Running
//! ```
//!
//! Every transition is journaled under the device id and emitted as a
//! status-change event. A generation counter ties each background watcher to
//! the lifecycle operation that spawned it, so a stale watcher never
//! overwrites the status set by a newer start, stop or restart.

use crate::error::{Result, SupervisorError};
use crate::journal::{FleetEvent, FleetEventKind, Journal, LogLevel};
use crate::launcher::{UnitLauncher, UnitProbe, UnitSpec};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thingsim::runtime::RuntimeStatsSnapshot;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Extra time a stop waits for the watcher beyond the unit's grace period.
const STOP_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Restarting,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnitStatus::Stopped => "stopped",
            UnitStatus::Starting => "starting",
            UnitStatus::Running => "running",
            UnitStatus::Stopping => "stopping",
            UnitStatus::Error => "error",
            UnitStatus::Restarting => "restarting",
        })
    }
}

/// Timing and restart budget for a supervised unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorPolicy {
    /// How long a unit gets to stop before it is forced
    pub stop_grace: Duration,
    /// Pause between tearing a unit down and relaunching it
    pub restart_backoff: Duration,
    pub max_restarts: u32,
    /// A running unit with no activity for this long is unhealthy
    pub stale_after: Duration,
    /// Restart crashed units without waiting for a health sweep
    pub auto_restart: bool,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(30),
            restart_backoff: Duration::from_secs(2),
            max_restarts: 5,
            stale_after: Duration::from_secs(5 * 60),
            auto_restart: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitStats {
    pub device_id: String,
    pub status: UnitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub total_uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeStatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

struct StopRequest {
    grace: Duration,
    ack: oneshot::Sender<()>,
}

struct UnitState {
    status: UnitStatus,
    generation: u64,
    instance_id: Option<Uuid>,
    restart_count: u32,
    error_count: u64,
    last_error: Option<String>,
    retryable: bool,
    start_time: Option<DateTime<Utc>>,
    running_since: Option<Instant>,
    uptime: Duration,
    probe: Option<Arc<dyn UnitProbe>>,
    stop_tx: Option<oneshot::Sender<StopRequest>>,
}

impl UnitState {
    fn new() -> Self {
        Self {
            status: UnitStatus::Stopped,
            generation: 0,
            instance_id: None,
            restart_count: 0,
            error_count: 0,
            last_error: None,
            retryable: true,
            start_time: None,
            running_since: None,
            uptime: Duration::ZERO,
            probe: None,
            stop_tx: None,
        }
    }

    fn close_uptime(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.uptime += since.elapsed();
        }
    }

    fn total_uptime(&self) -> Duration {
        self.uptime + self.running_since.map(|s| s.elapsed()).unwrap_or_default()
    }
}

struct Inner {
    spec: UnitSpec,
    launcher: Arc<dyn UnitLauncher>,
    journal: Arc<Journal>,
    policy: SupervisorPolicy,
    state: RwLock<UnitState>,
}

/// Owns the lifecycle of one unit. Cloning yields another handle to the
/// same unit.
#[derive(Clone)]
pub struct DeviceSupervisor {
    inner: Arc<Inner>,
}

enum WatchOutcome {
    Exited(std::result::Result<(), String>),
    StopRequested(Option<StopRequest>),
}

impl DeviceSupervisor {
    pub fn new(
        spec: UnitSpec,
        launcher: Arc<dyn UnitLauncher>,
        journal: Arc<Journal>,
        policy: SupervisorPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                spec,
                launcher,
                journal,
                policy,
                state: RwLock::new(UnitState::new()),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.spec.device_id
    }

    pub fn spec(&self) -> &UnitSpec {
        &self.inner.spec
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.inner.policy
    }

    pub fn status(&self) -> UnitStatus {
        self.read().status
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, UnitState> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, UnitState> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a transition in the journal and the event queue.
    fn transition(&self, state: &mut UnitState, to: UnitStatus, message: &str) {
        let from = state.status;
        state.status = to;
        let level = if to == UnitStatus::Error {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        self.inner
            .journal
            .log(self.device_id(), level, format!("{} -> {}: {}", from, to, message));
        self.inner.journal.emit(
            FleetEvent::new(self.device_id(), FleetEventKind::StatusChange, message)
                .with_status(to)
                .with_pid(state.probe.as_ref().and_then(|p| p.pid())),
        );
    }

    /// Launches the unit in the background.
    ///
    /// Refused while the unit is running, starting, stopping or restarting.
    /// An explicit start resets the restart budget.
    pub fn start(&self) -> Result<()> {
        let generation = {
            let mut state = self.write();
            match state.status {
                UnitStatus::Running | UnitStatus::Starting => {
                    return Err(SupervisorError::AlreadyRunning(self.device_id().to_string()))
                }
                UnitStatus::Stopping | UnitStatus::Restarting => {
                    return Err(SupervisorError::Busy {
                        device_id: self.device_id().to_string(),
                        status: state.status.to_string(),
                    })
                }
                UnitStatus::Stopped | UnitStatus::Error => {}
            }
            state.generation += 1;
            state.restart_count = 0;
            state.last_error = None;
            state.retryable = true;
            self.transition(&mut state, UnitStatus::Starting, "starting");
            state.generation
        };

        tokio::spawn(self.clone().launch_and_watch(generation));
        Ok(())
    }

    /// Launches and then watches the unit until it exits or is asked to stop.
    /// Boxed because a crash can restart, which spawns this again.
    fn launch_and_watch(self, generation: u64) -> BoxFuture<'static, ()> {
        async move {
            let launched = self
                .inner
                .launcher
                .launch(&self.inner.spec, self.inner.journal.clone())
                .await;
            let mut unit = match launched {
                Ok(unit) => unit,
                Err(e) => {
                    self.fail(generation, e.to_string(), e.is_retryable());
                    return;
                }
            };

            let (stop_tx, mut stop_rx) = oneshot::channel();
            let pid = {
                let mut state = self.write();
                let current = state.generation == generation
                    && matches!(state.status, UnitStatus::Starting | UnitStatus::Restarting);
                if current {
                    let probe = unit.probe();
                    let pid = probe.pid();
                    state.probe = Some(probe);
                    state.stop_tx = Some(stop_tx);
                    state.instance_id = Some(Uuid::now_v7());
                    state.start_time = Some(Utc::now());
                    state.running_since = Some(Instant::now());
                    self.transition(&mut state, UnitStatus::Running, "running");
                    Some(pid)
                } else {
                    None
                }
            };
            let Some(pid) = pid else {
                // Superseded while launching.
                unit.shutdown(self.inner.policy.stop_grace).await;
                return;
            };
            self.inner.journal.emit(
                FleetEvent::new(
                    self.device_id(),
                    FleetEventKind::Start,
                    format!("launched ({})", self.inner.launcher.kind()),
                )
                .with_pid(pid),
            );

            let outcome = tokio::select! {
                exit = unit.exited() => WatchOutcome::Exited(exit),
                request = &mut stop_rx => WatchOutcome::StopRequested(request.ok()),
            };

            match outcome {
                WatchOutcome::StopRequested(Some(request)) => {
                    unit.shutdown(request.grace).await;
                    let _ = request.ack.send(());
                }
                WatchOutcome::StopRequested(None) => {
                    unit.shutdown(self.inner.policy.stop_grace).await;
                }
                WatchOutcome::Exited(Ok(())) => {
                    let mut state = self.write();
                    if state.generation == generation {
                        state.close_uptime();
                        state.stop_tx = None;
                        self.transition(&mut state, UnitStatus::Stopped, "exited");
                        state.probe = None;
                    }
                }
                WatchOutcome::Exited(Err(reason)) => self.crashed(generation, reason),
            }
        }
        .boxed()
    }

    fn crashed(&self, generation: u64, reason: String) {
        let restart = {
            let mut state = self.write();
            if state.generation != generation {
                return;
            }
            state.close_uptime();
            state.stop_tx = None;
            state.error_count += 1;
            state.retryable = true;
            state.last_error = Some(reason.clone());
            self.transition(&mut state, UnitStatus::Error, &format!("crashed: {}", reason));
            state.probe = None;
            self.inner.policy.auto_restart && state.restart_count < self.inner.policy.max_restarts
        };

        self.inner.journal.emit(
            FleetEvent::new(self.device_id(), FleetEventKind::Crash, reason),
        );

        if restart {
            let supervisor = self.clone();
            tokio::spawn(async move {
                if let Err(e) = supervisor.restart().await {
                    supervisor.inner.journal.log(
                        supervisor.device_id(),
                        LogLevel::Warn,
                        format!("automatic restart refused: {}", e),
                    );
                }
            });
        } else if self.inner.policy.auto_restart {
            self.inner.journal.log(
                self.device_id(),
                LogLevel::Error,
                format!(
                    "restart budget exhausted after {} restarts",
                    self.inner.policy.max_restarts
                ),
            );
        }
    }

    fn fail(&self, generation: u64, reason: String, retryable: bool) {
        let mut state = self.write();
        if state.generation != generation {
            return;
        }
        state.close_uptime();
        state.error_count += 1;
        state.retryable = retryable;
        state.last_error = Some(reason.clone());
        self.transition(&mut state, UnitStatus::Error, &reason);
    }

    /// Hands `stop_tx` a stop request and waits for the unit to go down.
    async fn tear_down(&self, stop_tx: Option<oneshot::Sender<StopRequest>>) {
        let Some(stop_tx) = stop_tx else {
            return;
        };
        let grace = self.inner.policy.stop_grace;
        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(StopRequest { grace, ack: ack_tx }).is_err() {
            return;
        }
        if tokio::time::timeout(grace + STOP_MARGIN, ack_rx).await.is_err() {
            self.inner.journal.log(
                self.device_id(),
                LogLevel::Warn,
                format!("did not stop within {:?}, giving up on it", grace),
            );
        }
    }

    /// Stops the unit, waiting at most the grace period. No-op when already
    /// stopped or stopping.
    pub async fn stop(&self) -> Result<()> {
        let stop_tx = {
            let mut state = self.write();
            if matches!(state.status, UnitStatus::Stopped | UnitStatus::Stopping) {
                return Ok(());
            }
            state.generation += 1;
            self.transition(&mut state, UnitStatus::Stopping, "stopping");
            state.stop_tx.take()
        };

        self.tear_down(stop_tx).await;

        let mut state = self.write();
        state.close_uptime();
        state.probe = None;
        self.transition(&mut state, UnitStatus::Stopped, "stopped");
        Ok(())
    }

    /// Tears the unit down, waits the backoff, then relaunches it in the
    /// background. Counts against the restart budget.
    pub async fn restart(&self) -> Result<()> {
        let (generation, stop_tx, count) = {
            let mut state = self.write();
            match state.status {
                UnitStatus::Restarting => {
                    return Err(SupervisorError::AlreadyRestarting(self.device_id().to_string()))
                }
                UnitStatus::Stopping => {
                    return Err(SupervisorError::Busy {
                        device_id: self.device_id().to_string(),
                        status: state.status.to_string(),
                    })
                }
                _ => {}
            }
            state.restart_count += 1;
            state.generation += 1;
            let count = state.restart_count;
            self.transition(&mut state, UnitStatus::Restarting, &format!("restart #{}", count));
            (state.generation, state.stop_tx.take(), count)
        };
        self.inner.journal.emit(FleetEvent::new(
            self.device_id(),
            FleetEventKind::Restart,
            format!("restart #{}", count),
        ));

        self.tear_down(stop_tx).await;
        {
            let mut state = self.write();
            state.close_uptime();
            state.probe = None;
        }

        tokio::time::sleep(self.inner.policy.restart_backoff).await;

        let current = {
            let state = self.read();
            state.generation == generation && state.status == UnitStatus::Restarting
        };
        if current {
            tokio::spawn(self.clone().launch_and_watch(generation));
        }
        Ok(())
    }

    /// Running, with activity newer than the staleness threshold.
    pub fn is_healthy(&self) -> bool {
        let state = self.read();
        if state.status != UnitStatus::Running {
            return false;
        }
        let Some(last) = state.probe.as_ref().and_then(|p| p.last_activity()) else {
            return false;
        };
        match (Utc::now() - last).to_std() {
            Ok(age) => age < self.inner.policy.stale_after,
            // Activity stamped in the future
            Err(_) => true,
        }
    }

    /// In error, retryable, and under the restart budget.
    pub fn should_restart(&self) -> bool {
        let state = self.read();
        state.status == UnitStatus::Error
            && state.retryable
            && state.restart_count < self.inner.policy.max_restarts
    }

    /// Moves a running unit with no recent activity to `Error` and tears
    /// the silent unit down in the background, bounded by the stop grace.
    pub fn mark_stale(&self) -> bool {
        let stop_tx = {
            let mut state = self.write();
            if state.status != UnitStatus::Running {
                return false;
            }
            let reason = format!(
                "no activity for {}s",
                self.inner.policy.stale_after.as_secs()
            );
            state.generation += 1;
            state.close_uptime();
            state.error_count += 1;
            state.retryable = true;
            state.last_error = Some(reason.clone());
            self.transition(&mut state, UnitStatus::Error, &reason);
            state.probe = None;
            state.stop_tx.take()
        };

        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.tear_down(stop_tx).await });
        true
    }

    pub fn stats(&self) -> UnitStats {
        let state = self.read();
        let probe = state.probe.as_ref();
        UnitStats {
            device_id: self.device_id().to_string(),
            status: state.status,
            instance_id: state.instance_id,
            start_time: state.start_time,
            last_heartbeat: probe.and_then(|p| p.last_activity()),
            restart_count: state.restart_count,
            error_count: state.error_count,
            last_error: state.last_error.clone(),
            total_uptime_secs: state.total_uptime().as_secs(),
            runtime: probe.and_then(|p| p.stats()),
            pid: probe.and_then(|p| p.pid()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::launcher::LaunchedUnit;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use thingsim::config::DeviceConfig;
    use thingsim::runtime::RuntimeStats;
    use thingsim::SimError;

    #[derive(Debug, Clone, Copy)]
    pub(crate) enum Behavior {
        Run,
        CrashAfter(Duration),
        FailLaunch { retryable: bool },
        IgnoreStop,
    }

    /// Launcher that plays back scripted unit behaviors.
    pub(crate) struct FakeLauncher {
        script: Mutex<VecDeque<Behavior>>,
        fallback: Behavior,
        pub launches: AtomicUsize,
        pub shutdowns: Arc<AtomicUsize>,
    }

    impl FakeLauncher {
        pub fn new(fallback: Behavior) -> Arc<Self> {
            Self::scripted(Vec::new(), fallback)
        }

        pub fn scripted(script: Vec<Behavior>, fallback: Behavior) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                launches: AtomicUsize::new(0),
                shutdowns: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    struct FakeUnit {
        behavior: Behavior,
        stats: RuntimeStats,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UnitLauncher for FakeLauncher {
        async fn launch(
            &self,
            spec: &UnitSpec,
            _journal: Arc<Journal>,
        ) -> Result<Box<dyn LaunchedUnit>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let behavior = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
            match behavior {
                Behavior::FailLaunch { retryable: false } => Err(SupervisorError::Launch {
                    device_id: spec.device_id.clone(),
                    source: SimError::config("rule.json", "bad rules"),
                }),
                Behavior::FailLaunch { retryable: true } => Err(SupervisorError::Spawn {
                    device_id: spec.device_id.clone(),
                    reason: "no such file".into(),
                }),
                _ => {
                    let stats = RuntimeStats::new();
                    stats.mark_started(Utc::now());
                    Ok(Box::new(FakeUnit {
                        behavior,
                        stats,
                        shutdowns: self.shutdowns.clone(),
                    }))
                }
            }
        }

        fn kind(&self) -> &'static str {
            "fake"
        }
    }

    #[async_trait]
    impl LaunchedUnit for FakeUnit {
        fn probe(&self) -> Arc<dyn UnitProbe> {
            Arc::new(self.stats.clone())
        }

        async fn exited(&mut self) -> std::result::Result<(), String> {
            match self.behavior {
                Behavior::CrashAfter(after) => {
                    tokio::time::sleep(after).await;
                    Err("boom".into())
                }
                _ => futures::future::pending().await,
            }
        }

        async fn shutdown(&mut self, grace: Duration) {
            if let Behavior::IgnoreStop = self.behavior {
                tokio::time::sleep(grace).await;
            }
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn fast_policy() -> SupervisorPolicy {
        SupervisorPolicy {
            stop_grace: Duration::from_millis(100),
            restart_backoff: Duration::from_millis(10),
            max_restarts: 2,
            stale_after: Duration::from_secs(60),
            auto_restart: false,
        }
    }

    pub(crate) fn spec(id: &str) -> UnitSpec {
        UnitSpec {
            device_id: id.into(),
            group: "g".into(),
            product_type: "boiler".into(),
            model_file: PathBuf::from("tsl.json"),
            rule_file: PathBuf::from("rule.json"),
            config: DeviceConfig::default(),
        }
    }

    fn supervisor(launcher: Arc<FakeLauncher>, policy: SupervisorPolicy) -> DeviceSupervisor {
        DeviceSupervisor::new(spec("d1"), launcher, Arc::new(Journal::default()), policy)
    }

    pub(crate) async fn wait_for(sup: &DeviceSupervisor, status: UnitStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.status() != status {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {}, still {}",
                status,
                sup.status()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let sup = supervisor(FakeLauncher::new(Behavior::Run), fast_policy());
        sup.start().unwrap();
        wait_for(&sup, UnitStatus::Running).await;
        assert!(sup.is_healthy());
        assert!(matches!(sup.start(), Err(SupervisorError::AlreadyRunning(_))));

        let stats = sup.stats();
        assert!(stats.instance_id.is_some());
        assert!(stats.start_time.is_some());
        assert!(stats.runtime.is_some());

        sup.stop().await.unwrap();
        assert_eq!(sup.status(), UnitStatus::Stopped);
        assert!(!sup.is_healthy());
        sup.stop().await.unwrap();
        assert_eq!(sup.status(), UnitStatus::Stopped);
    }

    #[tokio::test]
    async fn test_transitions_are_journaled() {
        let journal = Arc::new(Journal::default());
        let mut events = journal.events().take_receiver().unwrap();
        let sup = DeviceSupervisor::new(
            spec("d1"),
            FakeLauncher::new(Behavior::Run),
            journal.clone(),
            fast_policy(),
        );
        sup.start().unwrap();
        wait_for(&sup, UnitStatus::Running).await;
        sup.stop().await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.kind == FleetEventKind::StatusChange {
                statuses.push(event.status.unwrap());
            }
        }
        assert_eq!(
            statuses,
            vec![
                UnitStatus::Starting,
                UnitStatus::Running,
                UnitStatus::Stopping,
                UnitStatus::Stopped
            ]
        );
        assert_eq!(journal.logs().query(Some("d1"), 0).len(), 4);
    }

    #[tokio::test]
    async fn test_crash_sets_error_without_auto_restart() {
        let launcher = FakeLauncher::new(Behavior::CrashAfter(Duration::from_millis(10)));
        let sup = supervisor(launcher.clone(), fast_policy());
        sup.start().unwrap();
        wait_for(&sup, UnitStatus::Error).await;

        let stats = sup.stats();
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.last_error.as_deref(), Some("boom"));
        assert!(sup.should_restart());
        assert!(!sup.is_healthy());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auto_restart_stops_at_budget() {
        let launcher = FakeLauncher::new(Behavior::CrashAfter(Duration::from_millis(10)));
        let policy = SupervisorPolicy {
            auto_restart: true,
            ..fast_policy()
        };
        let sup = supervisor(launcher.clone(), policy);
        sup.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while launcher.launches.load(Ordering::SeqCst) < 3 || sup.status() != UnitStatus::Error {
            assert!(Instant::now() < deadline, "restarts never settled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);
        assert_eq!(sup.status(), UnitStatus::Error);
        let stats = sup.stats();
        assert_eq!(stats.restart_count, 2);
        assert_eq!(stats.error_count, 3);
        assert!(!sup.should_restart());
    }

    #[tokio::test]
    async fn test_load_failure_is_not_restartable() {
        let sup = supervisor(
            FakeLauncher::new(Behavior::FailLaunch { retryable: false }),
            fast_policy(),
        );
        sup.start().unwrap();
        wait_for(&sup, UnitStatus::Error).await;
        assert!(!sup.should_restart());
        assert!(sup.stats().last_error.unwrap().contains("bad rules"));
    }

    #[tokio::test]
    async fn test_restart_relaunches_and_counts() {
        let launcher = FakeLauncher::scripted(
            vec![Behavior::FailLaunch { retryable: true }],
            Behavior::Run,
        );
        let sup = supervisor(launcher.clone(), fast_policy());
        sup.start().unwrap();
        wait_for(&sup, UnitStatus::Error).await;
        assert!(sup.should_restart());

        sup.restart().await.unwrap();
        wait_for(&sup, UnitStatus::Running).await;
        assert_eq!(sup.stats().restart_count, 1);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_restart_is_refused() {
        let policy = SupervisorPolicy {
            restart_backoff: Duration::from_millis(200),
            ..fast_policy()
        };
        let sup = supervisor(FakeLauncher::new(Behavior::Run), policy);
        sup.start().unwrap();
        wait_for(&sup, UnitStatus::Running).await;

        let first = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.restart().await })
        };
        wait_for(&sup, UnitStatus::Restarting).await;
        assert!(matches!(
            sup.restart().await,
            Err(SupervisorError::AlreadyRestarting(_))
        ));
        assert!(matches!(sup.start(), Err(SupervisorError::Busy { .. })));

        first.await.unwrap().unwrap();
        wait_for(&sup, UnitStatus::Running).await;
        assert_eq!(sup.stats().restart_count, 1);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_bounded_when_unit_hangs() {
        let sup = supervisor(FakeLauncher::new(Behavior::IgnoreStop), fast_policy());
        sup.start().unwrap();
        wait_for(&sup, UnitStatus::Running).await;

        let started = Instant::now();
        sup.stop().await.unwrap();
        assert_eq!(sup.status(), UnitStatus::Stopped);
        assert!(started.elapsed() < Duration::from_millis(100) + STOP_MARGIN + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_stale_unit_becomes_restartable() {
        let policy = SupervisorPolicy {
            stale_after: Duration::from_millis(20),
            ..fast_policy()
        };
        let sup = supervisor(FakeLauncher::new(Behavior::Run), policy);
        sup.start().unwrap();
        wait_for(&sup, UnitStatus::Running).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!sup.is_healthy());
        assert!(sup.mark_stale());
        assert_eq!(sup.status(), UnitStatus::Error);
        assert!(sup.should_restart());

        sup.restart().await.unwrap();
        wait_for(&sup, UnitStatus::Running).await;
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_unit_is_shut_down_when_budget_spent() {
        let policy = SupervisorPolicy {
            max_restarts: 0,
            stale_after: Duration::from_millis(20),
            ..fast_policy()
        };
        let launcher = FakeLauncher::new(Behavior::Run);
        let sup = supervisor(launcher.clone(), policy);
        sup.start().unwrap();
        wait_for(&sup, UnitStatus::Running).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(sup.mark_stale());
        assert!(!sup.should_restart());

        let deadline = Instant::now() + Duration::from_secs(1);
        while launcher.shutdowns.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "stale unit was never shut down");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sup.status(), UnitStatus::Error);
        assert!(sup.stats().pid.is_none());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_during_launch_wins() {
        let sup = supervisor(FakeLauncher::new(Behavior::Run), fast_policy());
        sup.start().unwrap();
        sup.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.status(), UnitStatus::Stopped);
    }
}
