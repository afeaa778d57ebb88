use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Counters a running device publishes about itself.
///
/// Cloning shares the underlying counters, so a supervisor can hold a copy
/// and read it while the device runs.
#[derive(Clone, Default)]
pub struct RuntimeStats {
    /// Completed reporting cycles
    property_updates: Arc<AtomicU64>,
    /// Events reported to the framework
    event_triggers: Arc<AtomicU64>,
    /// Service invocations answered
    service_calls: Arc<AtomicU64>,
    /// Failed reports
    errors: Arc<AtomicU64>,
    start_time: Arc<RwLock<Option<DateTime<Utc>>>>,
    last_heartbeat: Arc<RwLock<Option<DateTime<Utc>>>>,
    last_report: Arc<RwLock<Option<DateTime<Utc>>>>,
}

/// Point-in-time copy of [`RuntimeStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStatsSnapshot {
    pub property_updates: u64,
    pub event_triggers: u64,
    pub service_calls: u64,
    pub errors: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_report: Option<DateTime<Utc>>,
}

fn write(slot: &RwLock<Option<DateTime<Utc>>>, at: DateTime<Utc>) {
    *slot.write().unwrap_or_else(|e| e.into_inner()) = Some(at);
}

fn read(slot: &RwLock<Option<DateTime<Utc>>>) -> Option<DateTime<Utc>> {
    *slot.read().unwrap_or_else(|e| e.into_inner())
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self, at: DateTime<Utc>) {
        write(&self.start_time, at);
        write(&self.last_heartbeat, at);
    }

    pub fn heartbeat(&self, at: DateTime<Utc>) {
        write(&self.last_heartbeat, at);
    }

    pub fn record_cycle(&self, at: DateTime<Utc>) {
        self.property_updates.fetch_add(1, Ordering::Relaxed);
        write(&self.last_report, at);
        write(&self.last_heartbeat, at);
    }

    pub fn record_event(&self) {
        self.event_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_service_call(&self) {
        self.service_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        read(&self.last_heartbeat)
    }

    pub fn snapshot(&self) -> RuntimeStatsSnapshot {
        RuntimeStatsSnapshot {
            property_updates: self.property_updates.load(Ordering::Relaxed),
            event_triggers: self.event_triggers.load(Ordering::Relaxed),
            service_calls: self.service_calls.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            start_time: read(&self.start_time),
            last_heartbeat: read(&self.last_heartbeat),
            last_report: read(&self.last_report),
        }
    }
}
