//! Backend selection and construction.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendKind, ExecutionBackend};
use crate::cloud::{CloudSandboxBackend, CloudSandboxOptions, HttpSandboxApi, SandboxApi};
use crate::container::{ContainerBackend, ContainerOptions};
use crate::error::{BackendError, Result};
use crate::local::{LocalBackend, LocalOptions};
use crate::retry::{RetryPolicy, RetryingBackend};

/// Secrets passed explicitly into backend construction and collaborators.
#[derive(Clone, Default)]
pub struct Credentials {
    pub anthropic_api_key: Option<String>,
    pub git_token: Option<String>,
    pub cloud_api_key: Option<String>,
    /// Overrides the configured provider URL when set.
    pub cloud_api_url: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(v: &Option<String>) -> &'static str {
            if v.is_some() {
                "<set>"
            } else {
                "<unset>"
            }
        }
        f.debug_struct("Credentials")
            .field("anthropic_api_key", &redact(&self.anthropic_api_key))
            .field("git_token", &redact(&self.git_token))
            .field("cloud_api_key", &redact(&self.cloud_api_key))
            .field("cloud_api_url", &self.cloud_api_url)
            .finish()
    }
}

/// Per-variant settings plus the retry policy applied to every backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    pub local: LocalOptions,
    pub container: ContainerOptions,
    pub cloud_sandbox: CloudSandboxOptions,
    pub retry: RetryPolicy,
}

/// Which backend variant a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    #[default]
    Local,
    #[serde(alias = "devcontainer", alias = "docker")]
    Container,
    #[serde(alias = "daytona", alias = "cloud-sandbox")]
    CloudSandbox,
}

impl From<RuntimeKind> for BackendKind {
    fn from(kind: RuntimeKind) -> Self {
        match kind {
            RuntimeKind::Local => BackendKind::Local,
            RuntimeKind::Container => BackendKind::Container,
            RuntimeKind::CloudSandbox => BackendKind::CloudSandbox,
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        BackendKind::from(*self).fmt(f)
    }
}

impl FromStr for RuntimeKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(RuntimeKind::Local),
            "container" | "devcontainer" | "docker" => Ok(RuntimeKind::Container),
            "cloud-sandbox" | "cloud_sandbox" | "daytona" => Ok(RuntimeKind::CloudSandbox),
            other => Err(BackendError::InvalidArgument(format!(
                "unknown runtime: {other}"
            ))),
        }
    }
}

/// Creates fresh, uninitialized backends. The caller owns the lifecycle.
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn ExecutionBackend>>;
}

/// Builds the configured variant and wraps it in [`RetryingBackend`].
pub struct DefaultBackendFactory {
    config: RuntimeConfig,
    sandbox_api: Option<Arc<dyn SandboxApi>>,
}

impl DefaultBackendFactory {
    /// Fails fast when the selected variant lacks a required credential.
    pub fn new(config: RuntimeConfig, credentials: &Credentials) -> Result<Self> {
        let sandbox_api = match config.kind {
            RuntimeKind::CloudSandbox => {
                let key = credentials.cloud_api_key.as_deref().ok_or_else(|| {
                    BackendError::MissingCredential(
                        "cloud sandbox API key (DAYTONA_API_KEY)".to_string(),
                    )
                })?;
                let url = credentials
                    .cloud_api_url
                    .clone()
                    .unwrap_or_else(|| config.cloud_sandbox.api_url.clone());
                Some(Arc::new(HttpSandboxApi::new(url, key)?) as Arc<dyn SandboxApi>)
            }
            _ => None,
        };
        Ok(Self {
            config,
            sandbox_api,
        })
    }

    /// Use a specific provider client for cloud sandboxes.
    pub fn with_sandbox_api(mut self, api: Arc<dyn SandboxApi>) -> Self {
        self.sandbox_api = Some(api);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&self) -> Result<Box<dyn ExecutionBackend>> {
        let inner: Box<dyn ExecutionBackend> = match self.config.kind {
            RuntimeKind::Local => Box::new(LocalBackend::new(self.config.local.clone())),
            RuntimeKind::Container => {
                Box::new(ContainerBackend::new(self.config.container.clone()))
            }
            RuntimeKind::CloudSandbox => {
                let api = self.sandbox_api.clone().ok_or_else(|| {
                    BackendError::MissingCredential("cloud sandbox API client".to_string())
                })?;
                Box::new(CloudSandboxBackend::new(
                    self.config.cloud_sandbox.clone(),
                    api,
                    self.config.retry.clone(),
                ))
            }
        };
        Ok(Box::new(RetryingBackend::new(
            inner,
            self.config.retry.clone(),
        )))
    }
}
