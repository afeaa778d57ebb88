use std::path::PathBuf;
use thingsim::SimError;

/// Failures of supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("device '{0}' is already running or starting")]
    AlreadyRunning(String),

    #[error("device '{0}' is already restarting")]
    AlreadyRestarting(String),

    #[error("device '{device_id}' is busy ({status})")]
    Busy { device_id: String, status: String },

    #[error("device '{0}' already exists")]
    AlreadyExists(String),

    #[error("device '{0}' not found")]
    NotFound(String),

    #[error("device group '{0}' not found")]
    GroupNotFound(String),

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("fleet is already running")]
    FleetRunning,

    /// The unit could not be built or registered.
    #[error("failed to launch '{device_id}': {source}")]
    Launch {
        device_id: String,
        #[source]
        source: SimError,
    },

    /// The worker process could not be spawned.
    #[error("failed to spawn worker for '{device_id}': {reason}")]
    Spawn { device_id: String, reason: String },

    #[error("fleet config error in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("invalid fleet config: {0}")]
    Invalid(String),
}

impl SupervisorError {
    pub fn config(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SupervisorError::Config {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Load-time failures are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SupervisorError::Launch { source, .. } => !source.is_load_error(),
            SupervisorError::Config { .. } | SupervisorError::Invalid(_) => false,
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
