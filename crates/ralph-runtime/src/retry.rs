//! Error classification and bounded retry for backend operations.
//!
//! Failures are split into transient (network and availability problems that
//! are expected to clear), not-found, and terminal. Only transient failures are
//! retried, with a linearly growing delay of `attempt * base_delay_ms`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{BackendKind, ExecuteOptions, ExecuteResult, ExecutionBackend, LifecycleState};
use crate::error::{BackendError, Result};
use crate::metrics::METRICS;

const TRANSIENT_MARKERS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "connection reset",
    "connection refused",
    "etimedout",
    "timed out",
    "timeout",
    "enotfound",
    "dns",
    "socket hang up",
    "network",
    "429",
    "502",
    "503",
];

const NOT_FOUND_MARKERS: &[&str] = &["not found", "does not exist", "404"];

/// How the retry layer treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    NotFound,
    Terminal,
}

/// Classify a failure message. Transient markers take precedence.
pub fn classify(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Transient
    } else if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::NotFound
    } else {
        ErrorClass::Terminal
    }
}

/// Attempt cap and backoff base for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Run `op`, retrying transient failures according to `policy`.
///
/// Terminal failures propagate after a single invocation. A terminal failure
/// whose message reads as not-found is surfaced as [`BackendError::NotFound`].
/// When the attempt cap is exhausted the last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match err.class() {
            ErrorClass::Transient if attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                METRICS.inc_backend_retries();
                warn!(
                    operation = %operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient backend failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            ErrorClass::Transient => return Err(err),
            ErrorClass::NotFound => {
                return Err(match err {
                    BackendError::NotFound(_) => err,
                    other => BackendError::NotFound(other.to_string()),
                })
            }
            ErrorClass::Terminal => return Err(err),
        }
    }
}

/// Decorator that applies one [`RetryPolicy`] to every operation of a backend.
///
/// Lifecycle calls pass straight through: `initialize` is never re-invoked
/// because a half-provisioned resource must be released via `cleanup` first.
pub struct RetryingBackend {
    inner: Box<dyn ExecutionBackend>,
    policy: RetryPolicy,
}

impl RetryingBackend {
    pub fn new(inner: Box<dyn ExecutionBackend>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl ExecutionBackend for RetryingBackend {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn workspace(&self) -> &str {
        self.inner.workspace()
    }

    fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.inner.initialize().await
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.inner.cleanup().await
    }

    async fn execute(&self, command: &str, options: &ExecuteOptions) -> Result<ExecuteResult> {
        with_retry(&self.policy, "execute", || self.inner.execute(command, options)).await
    }

    async fn execute_argv(
        &self,
        argv: &[String],
        options: &ExecuteOptions,
    ) -> Result<ExecuteResult> {
        with_retry(&self.policy, "execute_argv", || {
            self.inner.execute_argv(argv, options)
        })
        .await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        with_retry(&self.policy, "write_file", || {
            self.inner.write_file(path, contents)
        })
        .await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        with_retry(&self.policy, "read_file", || self.inner.read_file(path)).await
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        with_retry(&self.policy, "file_exists", || self.inner.file_exists(path)).await
    }
}
