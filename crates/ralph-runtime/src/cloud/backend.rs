use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::api::{CreateSandboxRequest, RemoteCommand, RemoteExecution, SandboxApi};
use crate::backend::{
    resolve_path, BackendKind, ExecuteOptions, ExecuteResult, ExecutionBackend, Lifecycle,
    LifecycleState,
};
use crate::error::{BackendError, Result};
use crate::metrics::METRICS;
use crate::process::timeout_exit_code;
use crate::retry::{with_retry, RetryPolicy};

pub const DEFAULT_API_URL: &str = "https://app.daytona.io/api";
pub const DEFAULT_CLOUD_WORKSPACE: &str = "/home/daytona/workspace";

/// Settings for [`CloudSandboxBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSandboxOptions {
    pub api_url: String,
    pub workspace: String,
    pub language: Option<String>,
    /// Command that must exit 0 right after provisioning.
    pub baseline_probe: String,
    pub create_timeout_ms: u64,
    pub auto_stop_minutes: Option<u32>,
}

impl Default for CloudSandboxOptions {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            workspace: DEFAULT_CLOUD_WORKSPACE.to_string(),
            language: Some("typescript".to_string()),
            baseline_probe: "node --version".to_string(),
            create_timeout_ms: 120_000,
            auto_stop_minutes: None,
        }
    }
}

/// A remote managed sandbox reached through a [`SandboxApi`].
pub struct CloudSandboxBackend {
    lifecycle: Lifecycle,
    options: CloudSandboxOptions,
    api: Arc<dyn SandboxApi>,
    retry: RetryPolicy,
    sandbox_id: Option<String>,
}

impl CloudSandboxBackend {
    pub fn new(options: CloudSandboxOptions, api: Arc<dyn SandboxApi>, retry: RetryPolicy) -> Self {
        let id = format!("cloud-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        Self {
            lifecycle: Lifecycle::new(id),
            options,
            api,
            retry,
            sandbox_id: None,
        }
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        self.sandbox_id.as_deref()
    }

    fn running(&self) -> Result<&str> {
        self.lifecycle.ensure_ready()?;
        self.sandbox_id
            .as_deref()
            .ok_or_else(|| BackendError::NotReady {
                id: self.lifecycle.id().to_string(),
                state: self.lifecycle.state(),
            })
    }

    fn provision_error(&self, reason: impl Into<String>) -> BackendError {
        BackendError::Provision {
            kind: BackendKind::CloudSandbox,
            reason: reason.into(),
        }
    }

    async fn run_remote(
        &self,
        sandbox_id: &str,
        command: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecuteResult> {
        let secs = options.timeout_ms.div_ceil(1_000).max(1);
        let script = remote_script(command, secs)?;
        let request = RemoteCommand {
            command: script,
            env: remote_env(options)?,
            cwd: Some(
                options
                    .cwd
                    .as_deref()
                    .map(|c| resolve_path(&self.options.workspace, c))
                    .unwrap_or_else(|| self.options.workspace.clone()),
            ),
            timeout: secs,
        };

        let started = Instant::now();
        let exec: RemoteExecution = self.api.execute(sandbox_id, &request).await?;
        let exit_code = timeout_exit_code(exec.exit_code, started.elapsed(), options.timeout_ms);
        Ok(ExecuteResult {
            stdout: exec.result,
            stderr: String::new(),
            exit_code,
        })
    }
}

/// Build the single command string the provider accepts: the user command as
/// one quoted `sh -c` argument, wrapped in a KILL timeout.
fn remote_script(command: &str, timeout_secs: u64) -> Result<String> {
    let secs = timeout_secs.to_string();
    shlex::try_join(["timeout", "--signal=KILL", secs.as_str(), "sh", "-c", command])
        .map_err(|err| BackendError::InvalidArgument(format!("cannot quote command: {err}")))
}

/// The environment overlay travels in the request body, never in the
/// command text the provider may log.
fn remote_env(options: &ExecuteOptions) -> Result<BTreeMap<String, String>> {
    if let Some(bad) = options.env.keys().find(|key| !is_env_name(key)) {
        return Err(BackendError::InvalidArgument(format!(
            "invalid environment variable name: {bad:?}"
        )));
    }
    Ok(options.env.clone())
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[async_trait]
impl ExecutionBackend for CloudSandboxBackend {
    fn id(&self) -> &str {
        self.lifecycle.id()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::CloudSandbox
    }

    fn workspace(&self) -> &str {
        &self.options.workspace
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    #[instrument(skip(self), fields(backend = %self.lifecycle.id()))]
    async fn initialize(&mut self) -> Result<()> {
        self.lifecycle.begin_initialize()?;

        let request = CreateSandboxRequest {
            language: self.options.language.clone(),
            labels: [("ralph.backend".to_string(), self.lifecycle.id().to_string())]
                .into_iter()
                .collect(),
            auto_stop_interval: self.options.auto_stop_minutes,
        };
        let limit = Duration::from_millis(self.options.create_timeout_ms);
        let api = self.api.clone();
        let handle = with_retry(&self.retry, "create_sandbox", || {
            let api = api.clone();
            let request = &request;
            async move {
                tokio::time::timeout(limit, api.create_sandbox(request))
                    .await
                    .map_err(|_| {
                        BackendError::Transport(format!(
                            "sandbox creation timed out after {}ms",
                            limit.as_millis()
                        ))
                    })?
            }
        })
        .await
        .map_err(|err| self.provision_error(err.to_string()))?;

        self.sandbox_id = Some(handle.id.clone());
        info!(sandbox = %handle.id, "cloud sandbox created");

        let setup = ExecuteOptions::in_dir("/").with_timeout_ms(60_000);
        let workspace = self.options.workspace.clone();
        let quoted = shlex::try_quote(&workspace)
            .map_err(|err| BackendError::InvalidArgument(format!("cannot quote path: {err}")))?;
        let mkdir_cmd = format!("mkdir -p {quoted}");
        let mkdir = with_retry(&self.retry, "prepare_workspace", || {
            self.run_remote(&handle.id, &mkdir_cmd, &setup)
        })
        .await?;
        if !mkdir.success() {
            return Err(self.provision_error(format!(
                "cannot create workspace {workspace}: {}",
                mkdir.stdout.trim()
            )));
        }

        let probe_cmd = self.options.baseline_probe.clone();
        let probe = with_retry(&self.retry, "baseline_probe", || {
            self.run_remote(&handle.id, &probe_cmd, &setup)
        })
        .await?;
        if !probe.success() {
            return Err(self.provision_error(format!(
                "baseline check `{probe_cmd}` failed (exit {}): {}",
                probe.exit_code,
                probe.stdout.trim()
            )));
        }
        debug!(probe = %probe_cmd, output = %probe.stdout.trim(), "baseline check passed");

        self.lifecycle.mark_ready();
        METRICS.inc_backends_provisioned();
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        if !self.lifecycle.terminate() {
            return Ok(());
        }
        let Some(sandbox) = self.sandbox_id.take() else {
            return Ok(());
        };
        let api = self.api.clone();
        let deleted = with_retry(&self.retry, "delete_sandbox", || {
            let api = api.clone();
            let sandbox = sandbox.clone();
            async move { api.delete_sandbox(&sandbox).await }
        })
        .await;
        METRICS.inc_backends_cleaned_up();
        match deleted {
            Ok(()) => Ok(()),
            Err(BackendError::NotFound(_)) => {
                debug!(sandbox = %sandbox, "sandbox already deleted");
                Ok(())
            }
            Err(err) => {
                warn!(sandbox = %sandbox, error = %err, "failed to delete sandbox");
                Err(err)
            }
        }
    }

    async fn execute(&self, command: &str, options: &ExecuteOptions) -> Result<ExecuteResult> {
        let sandbox = self.running()?;
        self.run_remote(sandbox, command, options).await
    }

    async fn execute_argv(
        &self,
        argv: &[String],
        options: &ExecuteOptions,
    ) -> Result<ExecuteResult> {
        let sandbox = self.running()?;
        if argv.is_empty() {
            return Err(BackendError::InvalidArgument(
                "empty argument vector".to_string(),
            ));
        }
        let command = shlex::try_join(argv.iter().map(String::as_str))
            .map_err(|err| BackendError::InvalidArgument(format!("cannot quote argv: {err}")))?;
        self.run_remote(sandbox, &command, options).await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let sandbox = self.running()?;
        let target = resolve_path(&self.options.workspace, path);
        self.api.upload_file(sandbox, &target, contents).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let sandbox = self.running()?;
        let target = resolve_path(&self.options.workspace, path);
        self.api
            .download_file(sandbox, &target)
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    BackendError::NotFound(target.clone())
                } else {
                    err
                }
            })
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let sandbox = self.running()?;
        let target = resolve_path(&self.options.workspace, path);
        let quoted = shlex::try_quote(&target)
            .map_err(|err| BackendError::InvalidArgument(format!("cannot quote path: {err}")))?;
        let out = self
            .run_remote(
                sandbox,
                &format!("test -e {quoted}"),
                &ExecuteOptions::default(),
            )
            .await?;
        Ok(out.success())
    }
}
