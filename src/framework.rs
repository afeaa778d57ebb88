//! Device-connectivity framework boundary.
//!
//! The simulation core never speaks a transport itself. It registers
//! property accessors and service handlers with a [`DeviceFramework`] and
//! hands it property batches and event payloads to publish. Whatever sits
//! behind the trait (an MQTT SDK, a test double) owns authentication,
//! reconnection and delivery.
//!
//! [`LoopbackFramework`] is the in-tree implementation: it keeps
//! registrations in memory, logs every report as a JSON line and lets the
//! caller drive the device the way a platform would (get, set, invoke).

use crate::error::SimError;
use crate::generator::PropertyValues;
use crate::rules::ServiceResponse;
use crate::value::PropertyValue;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Reads the current value of a property.
pub type PropertyGetter = Arc<dyn Fn() -> Option<PropertyValue> + Send + Sync>;

/// Accepts a value written by the platform.
pub type PropertySetter = Arc<dyn Fn(&serde_json::Value) -> Result<(), SimError> + Send + Sync>;

/// Handles one service invocation.
pub type ServiceHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<ServiceResponse, SimError>> + Send + Sync,
>;

#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("transport not started")]
    NotStarted,
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Who a simulated device claims to be.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub product_key: String,
    pub device_name: String,
}

/// Operations the simulation core needs from the connectivity layer.
#[async_trait]
pub trait DeviceFramework: Send + Sync {
    fn register_device(&self, identity: &DeviceIdentity) -> Result<(), FrameworkError>;

    /// Registers a property. `setter` is `None` for read-only properties.
    fn register_property(
        &self,
        identifier: &str,
        getter: PropertyGetter,
        setter: Option<PropertySetter>,
    ) -> Result<(), FrameworkError>;

    fn register_service(&self, identifier: &str, handler: ServiceHandler) -> Result<(), FrameworkError>;

    async fn report_properties(&self, properties: &PropertyValues) -> Result<(), FrameworkError>;

    async fn report_event(&self, identifier: &str, payload: serde_json::Value) -> Result<(), FrameworkError>;

    async fn start(&self) -> Result<(), FrameworkError>;

    async fn stop(&self) -> Result<(), FrameworkError>;

    /// Resolves when the transport wants the device to shut down.
    async fn wait_for_shutdown(&self) {
        futures::future::pending::<()>().await
    }
}

/// Something the loopback framework was asked to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Properties(PropertyValues),
    Event {
        identifier: String,
        payload: serde_json::Value,
    },
}

const REPORT_HISTORY: usize = 1000;

/// In-memory framework that records everything it is given.
pub struct LoopbackFramework {
    identity: RwLock<Option<DeviceIdentity>>,
    getters: DashMap<String, PropertyGetter>,
    setters: DashMap<String, PropertySetter>,
    services: DashMap<String, ServiceHandler>,
    reports: Mutex<VecDeque<Report>>,
    report_count: AtomicU64,
    started: AtomicBool,
    fail_reports: AtomicBool,
    reject_registrations: AtomicBool,
    shutdown: Notify,
}

impl Default for LoopbackFramework {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFramework {
    pub fn new() -> Self {
        Self {
            identity: RwLock::new(None),
            getters: DashMap::new(),
            setters: DashMap::new(),
            services: DashMap::new(),
            reports: Mutex::new(VecDeque::new()),
            report_count: AtomicU64::new(0),
            started: AtomicBool::new(false),
            fail_reports: AtomicBool::new(false),
            reject_registrations: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    fn device_label(&self) -> String {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|id| id.device_id.clone())
            .unwrap_or_default()
    }

    fn record(&self, report: Report) {
        self.report_count.fetch_add(1, Ordering::Relaxed);
        let mut reports = self.reports.lock().unwrap_or_else(|e| e.into_inner());
        reports.push_back(report);
        while reports.len() > REPORT_HISTORY {
            reports.pop_front();
        }
    }

    fn check_publish(&self) -> Result<(), FrameworkError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(FrameworkError::NotStarted);
        }
        if self.fail_reports.load(Ordering::Relaxed) {
            return Err(FrameworkError::Publish("injected failure".into()));
        }
        Ok(())
    }

    /// Makes every subsequent publish fail.
    pub fn set_fail_reports(&self, fail: bool) {
        self.fail_reports.store(fail, Ordering::Relaxed);
    }

    /// Makes every subsequent registration fail.
    pub fn set_reject_registrations(&self, reject: bool) {
        self.reject_registrations.store(reject, Ordering::Relaxed);
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Recent reports, oldest first.
    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn report_count(&self) -> u64 {
        self.report_count.load(Ordering::Relaxed)
    }

    pub fn registered_properties(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.getters.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn registered_services(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_writable(&self, identifier: &str) -> bool {
        self.setters.contains_key(identifier)
    }

    /// Platform-side property read.
    pub fn get_property(&self, identifier: &str) -> Option<PropertyValue> {
        let getter = self.getters.get(identifier)?.value().clone();
        getter()
    }

    /// Platform-side property write.
    pub fn set_property(&self, identifier: &str, value: &serde_json::Value) -> Result<(), SimError> {
        let setter = self
            .setters
            .get(identifier)
            .map(|e| e.value().clone())
            .ok_or_else(|| SimError::InvalidValue {
                identifier: identifier.to_string(),
                value: value.to_string(),
                reason: "property is not writable".into(),
            })?;
        setter(value)
    }

    /// Platform-side service call.
    pub async fn invoke_service(
        &self,
        identifier: &str,
        params: serde_json::Value,
    ) -> Result<ServiceResponse, SimError> {
        let handler = self
            .services
            .get(identifier)
            .map(|e| e.value().clone())
            .ok_or_else(|| SimError::UnknownService(identifier.to_string()))?;
        handler(params).await
    }

    /// Asks whoever waits in `wait_for_shutdown` to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }
}

#[async_trait]
impl DeviceFramework for LoopbackFramework {
    fn register_device(&self, identity: &DeviceIdentity) -> Result<(), FrameworkError> {
        info!(
            device_id = %identity.device_id,
            product_key = %identity.product_key,
            device_name = %identity.device_name,
            "Device registered"
        );
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = Some(identity.clone());
        Ok(())
    }

    fn register_property(
        &self,
        identifier: &str,
        getter: PropertyGetter,
        setter: Option<PropertySetter>,
    ) -> Result<(), FrameworkError> {
        if self.reject_registrations.load(Ordering::Relaxed) {
            return Err(FrameworkError::Rejected(format!("property '{}'", identifier)));
        }
        if self.getters.contains_key(identifier) {
            return Err(FrameworkError::Rejected(format!(
                "property '{}' is already registered",
                identifier
            )));
        }
        self.getters.insert(identifier.to_string(), getter);
        if let Some(setter) = setter {
            self.setters.insert(identifier.to_string(), setter);
        }
        debug!(property = %identifier, "Property registered");
        Ok(())
    }

    fn register_service(&self, identifier: &str, handler: ServiceHandler) -> Result<(), FrameworkError> {
        if self.reject_registrations.load(Ordering::Relaxed) {
            return Err(FrameworkError::Rejected(format!("service '{}'", identifier)));
        }
        if self.services.contains_key(identifier) {
            return Err(FrameworkError::Rejected(format!(
                "service '{}' is already registered",
                identifier
            )));
        }
        self.services.insert(identifier.to_string(), handler);
        debug!(service = %identifier, "Service registered");
        Ok(())
    }

    async fn report_properties(&self, properties: &PropertyValues) -> Result<(), FrameworkError> {
        self.check_publish()?;
        let body = serde_json::to_string(properties).map_err(|e| FrameworkError::Publish(e.to_string()))?;
        info!(device_id = %self.device_label(), properties = %body, "Reported properties");
        self.record(Report::Properties(properties.clone()));
        Ok(())
    }

    async fn report_event(&self, identifier: &str, payload: serde_json::Value) -> Result<(), FrameworkError> {
        self.check_publish()?;
        info!(device_id = %self.device_label(), event = %identifier, payload = %payload, "Reported event");
        self.record(Report::Event {
            identifier: identifier.to_string(),
            payload,
        });
        Ok(())
    }

    async fn start(&self) -> Result<(), FrameworkError> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<(), FrameworkError> {
        self.started.store(false, Ordering::Release);
        Ok(())
    }

    async fn wait_for_shutdown(&self) {
        self.shutdown.notified().await
    }
}
