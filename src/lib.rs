// Error taxonomy
pub mod error;

// Generated property values and numeric literals
pub mod value;

// Injectable wall clock
pub mod clock;

// Thing model documents
pub mod model;

// Simulation rule documents and consistency checks
pub mod rules;

// Property, event and service generators
pub mod generator;

// Device connectivity boundary
pub mod framework;

// Simulated device runtime
pub mod runtime;

// Per-device worker configuration
pub mod config;

// Default and LLM-backed rule generation
pub mod rulegen;

pub use error::{Result, SimError};
pub use framework::{DeviceFramework, DeviceIdentity, LoopbackFramework};
pub use model::ThingModel;
pub use rules::SimulationRuleSet;
pub use runtime::{RuntimeOptions, RuntimeState, SimulatedDevice};
pub use value::PropertyValue;
