//! Error taxonomy for the simulation engine.
//!
//! Load-time errors (`Config`, `Consistency`) are fatal for the unit being
//! built and never retried. `Registration` fails a start attempt. `Cycle`
//! errors are counted by the runtime and never abort it. `Crash` is produced
//! at the supervisor boundary when a unit dies unexpectedly.

use crate::generator::condition::ConditionError;
use crate::rules::consistency::ConsistencyReport;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Document unreadable or malformed.
    #[error("config error in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// Rule document violates a per-method constraint.
    #[error("invalid rule for '{identifier}': {reason}")]
    InvalidRule { identifier: String, reason: String },

    /// Thing model and rule set do not describe the same identifiers.
    #[error("thing model and rules are inconsistent: {0}")]
    Consistency(ConsistencyReport),

    /// The framework refused a registration.
    #[error("registration of '{identifier}' failed: {reason}")]
    Registration { identifier: String, reason: String },

    /// A single reporting cycle failed to publish.
    #[error("reporting failed: {0}")]
    Cycle(String),

    /// The unit terminated unexpectedly or panicked.
    #[error("unit crashed: {0}")]
    Crash(String),

    #[error("invalid trigger condition: {0}")]
    Condition(#[from] ConditionError),

    #[error("service '{0}' has no simulation config")]
    UnknownService(String),

    #[error("property '{0}' is not declared")]
    UnknownProperty(String),

    #[error("value {value} rejected for '{identifier}': {reason}")]
    InvalidValue {
        identifier: String,
        value: String,
        reason: String,
    },
}

impl SimError {
    pub fn config(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SimError::Config {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Load-time errors are never retried by supervisors.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            SimError::Config { .. } | SimError::InvalidRule { .. } | SimError::Consistency(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
