//! Run-level errors.

use ralph_runtime::BackendError;

use crate::config::ConfigError;
use crate::git_workflow::GitError;

/// Anything that aborts a flow or a run. The driver folds these into an
/// [`OrchestrationResult`](crate::result::OrchestrationResult) with status
/// `error`; they never escape [`Orchestrator::run`](crate::Orchestrator::run).
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl OrchestrationError {
    /// Best-effort message out of a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        OrchestrationError::Panicked(message)
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
