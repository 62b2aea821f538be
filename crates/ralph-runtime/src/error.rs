//! Error types for the execution backend layer.

use crate::backend::{BackendKind, LifecycleState};
use crate::retry::{classify, ErrorClass};

/// Errors produced by execution backends and the operations layered on them.
///
/// A failing command is *not* an error: non-zero exits come back as a normal
/// [`ExecuteResult`](crate::ExecuteResult). These variants cover the cases where
/// the backend itself cannot do what was asked.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend {id} is not ready (state: {state})")]
    NotReady { id: String, state: LifecycleState },

    #[error("backend {id} was terminated and cannot be re-initialized")]
    Terminated { id: String },

    #[error("failed to provision {kind} backend: {reason}")]
    Provision { kind: BackendKind, reason: String },

    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file operation on {path} failed: {reason}")]
    File { path: String, reason: String },

    #[error("git {operation} failed (exit {exit_code}): {stderr}")]
    Git {
        operation: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{program} exited with {exit_code}: {stderr}")]
    CommandFailed {
        program: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Classify this error for the retry layer.
    ///
    /// Structured variants carry a fixed class; variants that wrap provider or
    /// transport text fall back to message classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            BackendError::NotReady { .. }
            | BackendError::Terminated { .. }
            | BackendError::MissingCredential(_)
            | BackendError::InvalidArgument(_)
            | BackendError::Git { .. }
            | BackendError::CommandFailed { .. } => ErrorClass::Terminal,
            BackendError::NotFound(_) => ErrorClass::NotFound,
            BackendError::Spawn { source, .. } | BackendError::Io(source) => io_class(source),
            BackendError::Provision { reason, .. } => classify(reason),
            BackendError::Transport(message) => classify(message),
            BackendError::File { reason, .. } => classify(reason),
        }
    }

    /// Whether the retry layer should try the operation again.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this error reports a missing remote resource.
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

fn io_class(err: &std::io::Error) -> ErrorClass {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionAborted
        | ErrorKind::TimedOut
        | ErrorKind::Interrupted => ErrorClass::Transient,
        ErrorKind::NotFound => ErrorClass::NotFound,
        _ => classify(&err.to_string()),
    }
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;
