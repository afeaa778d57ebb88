//! Bounded log and event sinks shared by every supervised unit.
//!
//! Producers never wait. The log ring evicts its oldest entry when full;
//! the event queue rejects the newest event when full. Both count what
//! they lose.

use crate::device::UnitStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const DEFAULT_LOG_CAPACITY: usize = 10_000;
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Device id used for fleet-level entries.
pub const MANAGER_ID: &str = "manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub device_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Fixed-capacity log buffer.
pub struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, entry: LogEntry) {
        if self.capacity == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        while entries.len() >= self.capacity {
            entries.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(entry);
    }

    /// Newest first, optionally for one device. `limit` 0 means all.
    pub fn query(&self, device_id: Option<&str>, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let matching = entries
            .iter()
            .rev()
            .filter(|e| device_id.map_or(true, |id| e.device_id == id))
            .cloned();
        if limit == 0 {
            matching.collect()
        } else {
            matching.take(limit).collect()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries evicted or refused so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetEventKind {
    Start,
    Stop,
    StatusChange,
    Crash,
    Restart,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetEvent {
    pub device_id: String,
    pub kind: FleetEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UnitStatus>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl FleetEvent {
    pub fn new(device_id: impl Into<String>, kind: FleetEventKind, message: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            status: None,
            message: message.into(),
            timestamp: Utc::now(),
            pid: None,
        }
    }

    pub fn with_status(mut self, status: UnitStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }
}

/// Bounded event channel with a single consumer.
pub struct EventQueue {
    tx: mpsc::Sender<FleetEvent>,
    rx: Mutex<Option<mpsc::Receiver<FleetEvent>>>,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues `event`; returns false if it was dropped.
    pub fn push(&self, event: FleetEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Hands out the consumer end. Only the first caller gets it.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<FleetEvent>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Log ring plus event queue.
pub struct Journal {
    logs: LogRing,
    events: EventQueue,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY, DEFAULT_EVENT_CAPACITY)
    }
}

impl Journal {
    pub fn new(log_capacity: usize, event_capacity: usize) -> Self {
        Self {
            logs: LogRing::new(log_capacity),
            events: EventQueue::new(event_capacity),
        }
    }

    /// Traces `message` and keeps it in the ring.
    pub fn log(&self, device_id: &str, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(device_id = %device_id, "{}", message),
            LogLevel::Info => info!(device_id = %device_id, "{}", message),
            LogLevel::Warn => warn!(device_id = %device_id, "{}", message),
            LogLevel::Error => error!(device_id = %device_id, "{}", message),
        }
        self.record(device_id, level, message);
    }

    /// Keeps `message` in the ring without tracing it.
    pub fn record(&self, device_id: &str, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry {
            device_id: device_id.to_string(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn emit(&self, event: FleetEvent) -> bool {
        self.events.push(event)
    }

    pub fn logs(&self) -> &LogRing {
        &self.logs
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }
}
