//! Remote managed cloud sandbox backend.
//!
//! - [`api`]: the provider contract and its HTTP implementation
//! - [`backend`]: the [`ExecutionBackend`](crate::ExecutionBackend) built on it

pub mod api;
pub mod backend;

pub use api::{
    CreateSandboxRequest, HttpSandboxApi, RemoteCommand, RemoteExecution, SandboxApi,
    SandboxHandle,
};
pub use backend::{
    CloudSandboxBackend, CloudSandboxOptions, DEFAULT_API_URL, DEFAULT_CLOUD_WORKSPACE,
};
