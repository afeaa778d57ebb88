//! Simulated device runtime.
//!
//! Composes the three generators with a validated thing model and rule set,
//! registers the device with a [`DeviceFramework`], and runs the reporting
//! cycle until told to stop.
//!
//! ```text
//!  Created ──initialize──▶ Initialized ──run──▶ Running ──shutdown──▶ Stopped
//!                                                 │   ▲
//!                                                 ▼   │
//!                                     generate → events → report
//! ```

pub mod stats;


pub use stats::{RuntimeStats, RuntimeStatsSnapshot};

use crate::clock::{system_clock, SharedClock};
use crate::error::{Result, SimError};
use crate::framework::{
    DeviceFramework, DeviceIdentity, FrameworkError, PropertyGetter, PropertySetter, ServiceHandler,
};
use crate::generator::{
    EventFiring, EventTriggerEvaluator, PropertyValueGenerator, PropertyValues,
    ServiceResponseGenerator,
};
use crate::model::ThingModel;
use crate::rules::{check_consistency, ServiceResponse, SimulationRuleSet};
use crate::value::PropertyValue;
use futures::FutureExt;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SERVICE_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Period of the reporting cycle
    pub upload_interval: Duration,
    /// Period of liveness stamps between cycles
    pub heartbeat_interval: Duration,
    /// Simulated processing time of every service call
    pub service_delay: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            upload_interval: DEFAULT_UPLOAD_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            service_delay: DEFAULT_SERVICE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Initialized,
    Running,
    Stopped,
}

/// Outcome of one reporting cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub properties: PropertyValues,
    pub fired: Vec<EventFiring>,
    /// Reports the framework refused this cycle
    pub failures: usize,
}

/// One simulated device.
pub struct SimulatedDevice {
    identity: DeviceIdentity,
    model: Arc<ThingModel>,
    rules: Arc<SimulationRuleSet>,
    framework: Arc<dyn DeviceFramework>,
    clock: SharedClock,
    properties: Mutex<PropertyValueGenerator>,
    events: Mutex<EventTriggerEvaluator>,
    services: ServiceResponseGenerator,
    stats: RuntimeStats,
    options: RuntimeOptions,
    state: RwLock<RuntimeState>,
}

fn registration(identifier: &str) -> impl FnOnce(FrameworkError) -> SimError + '_ {
    move |e| SimError::Registration {
        identifier: identifier.to_string(),
        reason: e.to_string(),
    }
}

impl SimulatedDevice {
    /// Builds a device from a model and rules that must describe the same
    /// identifiers.
    pub fn new(
        identity: DeviceIdentity,
        model: ThingModel,
        rules: SimulationRuleSet,
        framework: Arc<dyn DeviceFramework>,
    ) -> Result<Self> {
        rules.validate()?;
        check_consistency(&model, &rules).map_err(SimError::Consistency)?;

        let clock = system_clock();
        Ok(Self {
            identity,
            model: Arc::new(model),
            rules: Arc::new(rules),
            framework,
            properties: Mutex::new(PropertyValueGenerator::new(clock.clone())),
            events: Mutex::new(EventTriggerEvaluator::new(clock.clone())),
            clock,
            services: ServiceResponseGenerator::new(),
            stats: RuntimeStats::new(),
            options: RuntimeOptions::default(),
            state: RwLock::new(RuntimeState::Created),
        })
    }

    /// Loads, validates and pairs a model file with a rule file.
    pub fn from_files(
        identity: DeviceIdentity,
        model_path: impl AsRef<Path>,
        rules_path: impl AsRef<Path>,
        framework: Arc<dyn DeviceFramework>,
    ) -> Result<Self> {
        let model = ThingModel::load(model_path)?;
        let rules = SimulationRuleSet::load(rules_path)?;
        Self::new(identity, model, rules, framework)
    }

    pub fn with_options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the clock and resets the generators onto it.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.properties = Mutex::new(PropertyValueGenerator::new(clock.clone()));
        self.events = Mutex::new(EventTriggerEvaluator::new(clock.clone()));
        self.clock = clock;
        self
    }

    /// Seeds the random sources.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.properties = Mutex::new(PropertyValueGenerator::seeded(self.clock.clone(), seed));
        self.services = ServiceResponseGenerator::seeded(seed);
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn model(&self) -> &ThingModel {
        &self.model
    }

    pub fn rules(&self) -> &SimulationRuleSet {
        &self.rules
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Shared handle to the device's counters.
    pub fn stats(&self) -> RuntimeStats {
        self.stats.clone()
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RuntimeState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Registers the device, its properties and its services.
    ///
    /// Accessors hold a weak reference, so the framework never keeps the
    /// device alive on its own.
    pub fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.state() != RuntimeState::Created {
            return Err(SimError::Registration {
                identifier: self.identity.device_id.clone(),
                reason: "device is already initialized".into(),
            });
        }

        self.framework
            .register_device(&self.identity)
            .map_err(registration(&self.identity.device_id))?;

        for prop in &self.model.properties {
            let id = prop.identifier.clone();
            let weak = Arc::downgrade(self);
            let getter: PropertyGetter = Arc::new(move || weak.upgrade()?.get_property(&id));

            let setter = prop.is_writable().then(|| {
                let id = prop.identifier.clone();
                let weak = Arc::downgrade(self);
                let setter: PropertySetter = Arc::new(move |value| match weak.upgrade() {
                    Some(device) => device.set_property(&id, value),
                    None => Err(SimError::Crash("device is gone".into())),
                });
                setter
            });

            self.framework
                .register_property(&prop.identifier, getter, setter)
                .map_err(registration(&prop.identifier))?;
        }

        for action in &self.model.actions {
            let handler = service_handler(Arc::downgrade(self), action.identifier.clone());
            self.framework
                .register_service(&action.identifier, handler)
                .map_err(registration(&action.identifier))?;
        }

        self.set_state(RuntimeState::Initialized);
        info!(
            device_id = %self.identity.device_id,
            properties = self.model.properties.len(),
            events = self.rules.events.len(),
            services = self.model.actions.len(),
            "Simulated device initialized"
        );
        Ok(())
    }

    /// Serves a property read from the generators.
    pub fn get_property(&self, identifier: &str) -> Option<PropertyValue> {
        let config = self.rules.property(identifier)?;
        let mut generator = self.properties.lock().unwrap_or_else(|e| e.into_inner());
        Some(generator.generate(identifier, config))
    }

    /// Validates a property write. Nothing is stored.
    pub fn set_property(&self, identifier: &str, value: &serde_json::Value) -> Result<()> {
        let config = self
            .model
            .property(identifier)
            .and_then(|_| self.rules.property(identifier))
            .ok_or_else(|| SimError::UnknownProperty(identifier.to_string()))?;

        match PropertyValueGenerator::validate(identifier, config, value) {
            Ok(()) => {
                info!(
                    device_id = %self.identity.device_id,
                    property = %identifier,
                    value = %value,
                    "Property set accepted"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    device_id = %self.identity.device_id,
                    property = %identifier,
                    error = %e,
                    "Property set rejected"
                );
                Err(e)
            }
        }
    }

    /// Answers a service call after the simulated processing delay.
    pub async fn invoke_service(
        &self,
        identifier: &str,
        params: serde_json::Value,
    ) -> Result<ServiceResponse> {
        let config = self
            .rules
            .service(identifier)
            .ok_or_else(|| SimError::UnknownService(identifier.to_string()))?;

        info!(
            device_id = %self.identity.device_id,
            service = %identifier,
            params = %params,
            "Service invoked"
        );
        tokio::time::sleep(self.options.service_delay).await;

        let response = self.services.respond(config);
        self.stats.record_service_call();
        debug!(
            device_id = %self.identity.device_id,
            service = %identifier,
            code = response.code,
            "Service answered"
        );
        Ok(response)
    }

    /// Current values of every declared property.
    pub fn generate_all(&self) -> PropertyValues {
        let mut generator = self.properties.lock().unwrap_or_else(|e| e.into_inner());
        self.model
            .properties
            .iter()
            .filter_map(|p| {
                let config = self.rules.property(&p.identifier)?;
                Some((p.identifier.clone(), generator.generate(&p.identifier, config)))
            })
            .collect()
    }

    fn evaluate_events(&self, values: &PropertyValues) -> Vec<EventFiring> {
        let mut evaluator = self.events.lock().unwrap_or_else(|e| e.into_inner());
        self.rules
            .events
            .iter()
            .filter_map(|config| evaluator.check(config, values))
            .collect()
    }

    /// Runs one cycle: generate, evaluate events, report events, report
    /// properties. Report failures are counted, never returned.
    pub async fn run_cycle(&self) -> CycleReport {
        let properties = self.generate_all();
        let fired = self.evaluate_events(&properties);
        let mut failures = 0;

        for firing in &fired {
            match self
                .framework
                .report_event(&firing.identifier, firing.payload())
                .await
            {
                Ok(()) => self.stats.record_event(),
                Err(e) => {
                    failures += 1;
                    self.stats.record_error();
                    warn!(
                        device_id = %self.identity.device_id,
                        event = %firing.identifier,
                        error = %SimError::Cycle(e.to_string()),
                        "Event report failed"
                    );
                }
            }
        }

        if !properties.is_empty() {
            if let Err(e) = self.framework.report_properties(&properties).await {
                failures += 1;
                self.stats.record_error();
                warn!(
                    device_id = %self.identity.device_id,
                    error = %SimError::Cycle(e.to_string()),
                    "Property report failed"
                );
            }
        }

        self.stats.record_cycle(self.clock.now());
        CycleReport {
            properties,
            fired,
            failures,
        }
    }

    /// Reports once, then cycles every upload interval until `shutdown`
    /// turns true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.state() != RuntimeState::Initialized {
            return Err(SimError::Registration {
                identifier: self.identity.device_id.clone(),
                reason: format!("cannot run from state {:?}", self.state()),
            });
        }
        self.set_state(RuntimeState::Running);
        self.stats.mark_started(self.clock.now());

        info!(
            device_id = %self.identity.device_id,
            interval_secs = self.options.upload_interval.as_secs(),
            "Simulated device running"
        );

        if !*shutdown.borrow() {
            self.run_cycle().await;
        }

        let upload = self.options.upload_interval.max(Duration::from_millis(1));
        let beat = self.options.heartbeat_interval.max(Duration::from_millis(1));
        let mut report_timer = interval_at(Instant::now() + upload, upload);
        report_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_timer = interval_at(Instant::now() + beat, beat);
        heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = report_timer.tick() => {
                    self.run_cycle().await;
                }
                _ = heartbeat_timer.tick() => {
                    self.stats.heartbeat(self.clock.now());
                }
            }
        }

        self.set_state(RuntimeState::Stopped);
        info!(device_id = %self.identity.device_id, "Simulated device stopped");
        Ok(())
    }
}

fn service_handler(device: Weak<SimulatedDevice>, identifier: String) -> ServiceHandler {
    Arc::new(move |params| {
        let device = device.clone();
        let identifier = identifier.clone();
        async move {
            let device = device
                .upgrade()
                .ok_or_else(|| SimError::Crash("device is gone".into()))?;
            device.invoke_service(&identifier, params).await
        }
        .boxed()
    })
}
