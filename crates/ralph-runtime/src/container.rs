//! Container backend driven through the `docker` CLI.
//!
//! Each instance runs its own detached container kept alive with
//! `tail -f /dev/null`. Commands go through `docker exec` with an argument
//! vector; the image is built at most once per process.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    resolve_path, BackendKind, ExecuteOptions, ExecuteResult, ExecutionBackend, Lifecycle,
    LifecycleState,
};
use crate::error::{BackendError, Result};
use crate::metrics::METRICS;
use crate::process::{
    run_process, timeout_exit_code, ProcessOutput, ProcessSpec, TIMEOUT_EXIT_CODE,
};

pub const DEFAULT_IMAGE: &str = "ralph-devcontainer:latest";
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Dockerfile used when the image is missing and no override is configured.
pub const DEFAULT_DOCKERFILE: &str = r#"FROM node:22-slim
RUN apt-get update \
    && apt-get install -y --no-install-recommends git curl ca-certificates coreutils \
    && rm -rf /var/lib/apt/lists/*
RUN npm install -g @anthropic-ai/claude-code
WORKDIR /workspace
"#;

/// Docker daemon calls that are not user commands.
const CONTROL_TIMEOUT_MS: u64 = 60_000;
const BUILD_TIMEOUT_MS: u64 = 900_000;
/// Extra time the host-side client gets beyond the in-container timeout.
const CLIENT_GRACE_MS: u64 = 5_000;

/// One readiness cell per image. The map lock only guards the lookup; the
/// probe and any build run under the image's own cell.
async fn image_cell(image: &str) -> Arc<OnceCell<()>> {
    static IMAGES: OnceLock<Mutex<HashMap<String, Arc<OnceCell<()>>>>> = OnceLock::new();
    let mut cells = IMAGES.get_or_init(|| Mutex::new(HashMap::new())).lock().await;
    cells.entry(image.to_string()).or_default().clone()
}

/// Settings for [`ContainerBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    pub image: String,
    /// Dockerfile contents used to build `image` when it does not exist.
    pub dockerfile: Option<String>,
    /// Host directory bind-mounted at `/workspace`. Unset keeps the
    /// container filesystem fully isolated.
    pub host_mount: Option<PathBuf>,
    pub docker_bin: String,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            dockerfile: None,
            host_mount: None,
            docker_bin: "docker".to_string(),
        }
    }
}

/// A dynamically provisioned container.
pub struct ContainerBackend {
    lifecycle: Lifecycle,
    options: ContainerOptions,
    container_id: Option<String>,
}

impl ContainerBackend {
    pub fn new(options: ContainerOptions) -> Self {
        let id = format!("container-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        Self {
            lifecycle: Lifecycle::new(id),
            options,
            container_id: None,
        }
    }

    /// Handle of the running container, once started.
    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    async fn docker(
        &self,
        args: Vec<String>,
        env: Option<&BTreeMap<String, String>>,
        stdin: Option<&[u8]>,
        timeout_ms: u64,
    ) -> Result<ProcessOutput> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.options.docker_bin.clone());
        argv.extend(args);
        run_process(ProcessSpec {
            argv: &argv,
            cwd: None,
            env,
            stdin,
            timeout_ms,
        })
        .await
    }

    fn provision_error(&self, reason: impl Into<String>) -> BackendError {
        BackendError::Provision {
            kind: BackendKind::Container,
            reason: reason.into(),
        }
    }

    async fn ensure_image(&self) -> Result<()> {
        let cell = image_cell(&self.options.image).await;
        cell.get_or_try_init(|| self.probe_or_build_image()).await?;
        Ok(())
    }

    async fn probe_or_build_image(&self) -> Result<()> {
        let image = &self.options.image;
        let probe = self
            .docker(
                strings(&["image", "inspect", image]),
                None,
                None,
                CONTROL_TIMEOUT_MS,
            )
            .await?;
        if probe.success() {
            debug!(image = %image, "image present");
            return Ok(());
        }

        let dockerfile = self
            .options
            .dockerfile
            .as_deref()
            .unwrap_or(DEFAULT_DOCKERFILE);
        info!(image = %image, "building container image");
        let build = self
            .docker(
                strings(&["build", "-t", image, "-"]),
                None,
                Some(dockerfile.as_bytes()),
                BUILD_TIMEOUT_MS,
            )
            .await?;
        if !build.success() {
            return Err(self.provision_error(format!(
                "image build failed for {image}: {}",
                tail(&build.stderr_lossy(), 2_000)
            )));
        }
        Ok(())
    }

    fn running(&self) -> Result<&str> {
        self.lifecycle.ensure_ready()?;
        self.container_id
            .as_deref()
            .ok_or_else(|| BackendError::NotReady {
                id: self.lifecycle.id().to_string(),
                state: self.lifecycle.state(),
            })
    }

    /// `docker exec` prefix. Overlay variables are named on the argv and their
    /// values travel through the client's environment.
    fn exec_prefix(
        &self,
        container: &str,
        cwd: Option<&str>,
        env: &BTreeMap<String, String>,
        interactive: bool,
    ) -> Vec<String> {
        let mut argv = vec!["exec".to_string()];
        if interactive {
            argv.push("-i".to_string());
        }
        if let Some(cwd) = cwd {
            argv.push("-w".to_string());
            argv.push(cwd.to_string());
        }
        for key in env.keys() {
            argv.push("-e".to_string());
            argv.push(key.clone());
        }
        argv.push(container.to_string());
        argv
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn id(&self) -> &str {
        self.lifecycle.id()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn workspace(&self) -> &str {
        CONTAINER_WORKSPACE
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    #[instrument(skip(self), fields(backend = %self.lifecycle.id(), image = %self.options.image))]
    async fn initialize(&mut self) -> Result<()> {
        self.lifecycle.begin_initialize()?;
        self.ensure_image().await?;

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--label".to_string(),
            format!("ralph.backend={}", self.lifecycle.id()),
            "-w".to_string(),
            CONTAINER_WORKSPACE.to_string(),
        ];
        if let Some(host) = &self.options.host_mount {
            args.push("-v".to_string());
            args.push(format!("{}:{}", host.display(), CONTAINER_WORKSPACE));
        }
        args.extend(strings(&[&self.options.image, "tail", "-f", "/dev/null"]));

        let started = self.docker(args, None, None, CONTROL_TIMEOUT_MS).await?;
        if !started.success() {
            return Err(self.provision_error(format!(
                "docker run failed: {}",
                tail(&started.stderr_lossy(), 2_000)
            )));
        }
        let container = started.stdout_lossy().trim().to_string();
        if container.is_empty() {
            return Err(self.provision_error("docker run returned no container id"));
        }
        self.container_id = Some(container.clone());

        let probe = self
            .docker(
                strings(&["exec", &container, "echo", "ok"]),
                None,
                None,
                CONTROL_TIMEOUT_MS,
            )
            .await?;
        if !probe.success() || probe.stdout_lossy().trim() != "ok" {
            return Err(self.provision_error("container is not responding to exec"));
        }

        self.lifecycle.mark_ready();
        METRICS.inc_backends_provisioned();
        info!(container = %container, "container backend ready");
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        if !self.lifecycle.terminate() {
            return Ok(());
        }
        let Some(container) = self.container_id.take() else {
            return Ok(());
        };
        let removed = self
            .docker(
                strings(&["rm", "-f", &container]),
                None,
                None,
                CONTROL_TIMEOUT_MS,
            )
            .await?;
        METRICS.inc_backends_cleaned_up();
        if !removed.success() {
            let stderr = removed.stderr_lossy();
            if stderr.contains("No such container") {
                debug!(container = %container, "container already gone");
                return Ok(());
            }
            warn!(container = %container, stderr = %stderr.trim(), "docker rm failed");
            return Err(BackendError::Transport(format!(
                "failed to remove container {container}: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn execute(&self, command: &str, options: &ExecuteOptions) -> Result<ExecuteResult> {
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        self.execute_argv(&argv, options).await
    }

    async fn execute_argv(
        &self,
        argv: &[String],
        options: &ExecuteOptions,
    ) -> Result<ExecuteResult> {
        let container = self.running()?;
        if argv.is_empty() {
            return Err(BackendError::InvalidArgument(
                "empty argument vector".to_string(),
            ));
        }
        let cwd = options
            .cwd
            .as_deref()
            .map(|c| resolve_path(CONTAINER_WORKSPACE, c))
            .unwrap_or_else(|| CONTAINER_WORKSPACE.to_string());

        let mut args = self.exec_prefix(container, Some(&cwd), &options.env, false);
        let secs = options.timeout_ms.div_ceil(1_000).max(1);
        args.extend(strings(&["timeout", "--signal=KILL", &secs.to_string()]));
        args.extend(argv.iter().cloned());

        let started = Instant::now();
        let out = self
            .docker(
                args,
                Some(&options.env),
                None,
                options.timeout_ms + CLIENT_GRACE_MS,
            )
            .await?;

        let exit_code = if out.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            timeout_exit_code(out.exit_code, started.elapsed(), options.timeout_ms)
        };
        Ok(ExecuteResult {
            stdout: out.stdout_lossy(),
            stderr: out.stderr_lossy(),
            exit_code,
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let container = self.running()?;
        let target = resolve_path(CONTAINER_WORKSPACE, path);
        let mut args = self.exec_prefix(container, None, &BTreeMap::new(), true);
        args.extend(strings(&[
            "sh",
            "-c",
            r#"mkdir -p "$(dirname "$1")" && cat > "$1""#,
            "sh",
            &target,
        ]));

        let out = self
            .docker(args, None, Some(contents), CONTROL_TIMEOUT_MS)
            .await?;
        if !out.success() {
            return Err(BackendError::File {
                path: target,
                reason: out.stderr_lossy().trim().to_string(),
            });
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let container = self.running()?;
        let target = resolve_path(CONTAINER_WORKSPACE, path);
        let mut args = self.exec_prefix(container, None, &BTreeMap::new(), false);
        args.extend(strings(&["cat", "--", &target]));

        let out = self.docker(args, None, None, CONTROL_TIMEOUT_MS).await?;
        if out.success() {
            return Ok(out.stdout);
        }
        let stderr = out.stderr_lossy();
        if stderr.contains("No such file") {
            Err(BackendError::NotFound(target))
        } else {
            Err(BackendError::File {
                path: target,
                reason: stderr.trim().to_string(),
            })
        }
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let container = self.running()?;
        let target = resolve_path(CONTAINER_WORKSPACE, path);
        let mut args = self.exec_prefix(container, None, &BTreeMap::new(), false);
        args.extend(strings(&["test", "-e", &target]));

        let out = self.docker(args, None, None, CONTROL_TIMEOUT_MS).await?;
        let stderr = out.stderr_lossy();
        match out.exit_code {
            0 if !out.timed_out => Ok(true),
            // `test` is silent; the docker client always explains its own failures.
            1 if stderr.trim().is_empty() => Ok(false),
            code => Err(BackendError::Transport(format!(
                "docker exec failed while checking {target} (exit {code}): {}",
                stderr.trim()
            ))),
        }
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}
