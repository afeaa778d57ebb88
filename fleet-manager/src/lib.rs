//! Fleet Manager - keeps many simulated devices alive.
//!
//! Each device runs under a [`DeviceSupervisor`] that launches it, watches it
//! and stops or restarts it on request. A [`FleetSupervisor`] builds those
//! supervisors from a fleet document and sweeps their health on a fixed
//! interval. [`ProcessSupervisor`] is the same fleet with one `thingsim`
//! worker process per device; in simple mode its units come from
//! [`device_dirs`] instead of a fleet document.
//!
//! # Architecture
//!
//! ```text
//!   devices.json + device_templates/
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │  FleetSupervisor / ProcessSupervisor     │
//! │  - Start enabled devices                 │
//! │  - Periodic health sweep                 │
//! │  - Log ring + event queue (Journal)      │
//! └─────────────────────────────────────────┘
//!          ↓ one per device
//! ┌─────────────────────────────────────────┐
//! │  DeviceSupervisor                        │
//! │  - Start / stop / restart                │
//! │  - Health, restart budget                │
//! └─────────────────────────────────────────┘
//!          ↓ UnitLauncher
//!   SimulatedDevice task   |   thingsim worker process
//! ```
//!
//! # Running a fleet
//!
//! ```no_run
//! use fleet_manager::{FleetOptions, FleetSupervisor, InProcessLauncher};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let fleet = FleetSupervisor::new(
//!     "configs/devices.json",
//!     "configs/device_templates",
//!     Arc::new(InProcessLauncher::new()),
//!     FleetOptions::default(),
//! );
//! let started = fleet.start().await?;
//! println!("{} devices running", started);
//! fleet.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod device_dirs;
pub mod error;
pub mod fleet_config;
pub mod journal;
pub mod launcher;
pub mod manager;
pub mod process_manager;
pub mod runners;

#[cfg(test)]
mod testing;

pub use device::{DeviceSupervisor, SupervisorPolicy, UnitStats, UnitStatus};
pub use error::SupervisorError;
pub use fleet_config::{DeviceTemplate, MultiDeviceConfig};
pub use journal::{FleetEvent, FleetEventKind, Journal, LogEntry, LogLevel};
pub use launcher::{UnitLauncher, UnitSpec};
pub use manager::{FleetOptions, FleetStats, FleetSupervisor};
pub use process_manager::{ProcessStats, ProcessSupervisor};
pub use runners::{InProcessLauncher, ProcessLauncher};
