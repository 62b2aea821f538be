//! Ralph Runtime
//!
//! Execution backends for the Ralph Loop and the policy layered over them.
//!
//! - [`backend`]: the uniform [`ExecutionBackend`] contract and lifecycle
//! - [`local`], [`container`], [`cloud`]: the three backend variants
//! - [`retry`]: error classification and bounded retry ([`RetryingBackend`])
//! - [`git`]: argument-vector git operations over any backend
//! - [`factory`]: variant selection and explicit [`Credentials`]
//! - [`process`]: the host process runner with process-group timeouts
//! - [`metrics`]: global atomic counters

pub mod backend;
pub mod cloud;
pub mod container;
pub mod error;
pub mod factory;
pub mod git;
pub mod local;
pub mod metrics;
pub mod process;
pub mod retry;

pub use backend::{
    BackendKind, ExecuteOptions, ExecuteResult, ExecutionBackend, Lifecycle, LifecycleState,
    DEFAULT_EXECUTE_TIMEOUT_MS,
};
pub use cloud::{CloudSandboxBackend, CloudSandboxOptions, HttpSandboxApi, SandboxApi};
pub use container::{ContainerBackend, ContainerOptions};
pub use error::{BackendError, Result};
pub use factory::{BackendFactory, Credentials, DefaultBackendFactory, RuntimeConfig, RuntimeKind};
pub use git::{GitFileStatus, GitOps, GitStatus};
pub use local::{LocalBackend, LocalOptions};
pub use metrics::METRICS;
pub use process::TIMEOUT_EXIT_CODE;
pub use retry::{classify, with_retry, ErrorClass, RetryPolicy, RetryingBackend};
