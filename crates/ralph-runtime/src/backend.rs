//! The execution backend contract shared by every variant.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// Default per-command timeout (milliseconds).
pub const DEFAULT_EXECUTE_TIMEOUT_MS: u64 = 120_000;

/// Which concrete environment a backend runs commands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Container,
    CloudSandbox,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Local => "local",
            BackendKind::Container => "container",
            BackendKind::CloudSandbox => "cloud-sandbox",
        })
    }
}

/// Lifecycle of a backend. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Ready => "ready",
            LifecycleState::Terminated => "terminated",
        })
    }
}

/// Forward-only lifecycle tracker embedded in each backend variant.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    id: String,
    state: LifecycleState,
}

impl Lifecycle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: LifecycleState::Uninitialized,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Check that `initialize()` may proceed.
    pub fn begin_initialize(&self) -> Result<()> {
        match self.state {
            LifecycleState::Uninitialized => Ok(()),
            LifecycleState::Terminated => Err(BackendError::Terminated {
                id: self.id.clone(),
            }),
            LifecycleState::Ready => Err(BackendError::InvalidArgument(format!(
                "backend {} is already initialized",
                self.id
            ))),
        }
    }

    pub fn mark_ready(&mut self) {
        if self.state == LifecycleState::Uninitialized {
            self.state = LifecycleState::Ready;
        }
    }

    /// Fail unless the backend is ready to run operations.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.state == LifecycleState::Ready {
            Ok(())
        } else {
            Err(BackendError::NotReady {
                id: self.id.clone(),
                state: self.state,
            })
        }
    }

    /// Move to `Terminated`. Returns `false` if it already was.
    pub fn terminate(&mut self) -> bool {
        let first = self.state != LifecycleState::Terminated;
        self.state = LifecycleState::Terminated;
        first
    }
}

/// Options for a single command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// Working directory; defaults to the backend workspace.
    pub cwd: Option<String>,
    pub timeout_ms: u64,
    /// Environment overlay applied on top of the backend's environment.
    pub env: BTreeMap<String, String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout_ms: DEFAULT_EXECUTE_TIMEOUT_MS,
            env: BTreeMap::new(),
        }
    }
}

impl ExecuteOptions {
    pub fn in_dir(cwd: impl Into<String>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Default::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a command. Non-zero exit codes are normal results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecuteResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Uniform command, file and lifecycle contract implemented by every backend.
///
/// Whoever calls [`initialize`](ExecutionBackend::initialize) owns the matching
/// [`cleanup`](ExecutionBackend::cleanup) call, on every exit path. Cleanup is
/// idempotent and tolerates a partially failed initialization.
///
/// Relative paths passed to file operations and `cwd` resolve against
/// [`workspace`](ExecutionBackend::workspace).
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Opaque identity, unique per instance.
    fn id(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Root directory of the backend's filesystem view.
    fn workspace(&self) -> &str;

    fn state(&self) -> LifecycleState;

    /// Acquire the underlying resource.
    async fn initialize(&mut self) -> Result<()>;

    /// Release the underlying resource.
    async fn cleanup(&mut self) -> Result<()>;

    /// Run a shell command string to completion or timeout.
    async fn execute(&self, command: &str, options: &ExecuteOptions) -> Result<ExecuteResult>;

    /// Run an argument vector without a shell.
    async fn execute_argv(&self, argv: &[String], options: &ExecuteOptions)
        -> Result<ExecuteResult>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn file_exists(&self, path: &str) -> Result<bool>;
}

/// Join `path` onto `base` unless it is already absolute.
pub fn resolve_path(base: &str, path: &str) -> String {
    if path.starts_with('/') || base.is_empty() {
        path.to_string()
    } else if path.is_empty() || path == "." {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}
