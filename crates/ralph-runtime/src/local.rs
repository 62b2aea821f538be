//! Host-process backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, instrument};

use crate::backend::{
    resolve_path, BackendKind, ExecuteOptions, ExecuteResult, ExecutionBackend, Lifecycle,
    LifecycleState,
};
use crate::error::{BackendError, Result};
use crate::metrics::METRICS;
use crate::process::{run_process, ProcessSpec};

/// Settings for [`LocalBackend`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalOptions {
    /// Existing directory to work in. When absent a temporary directory is
    /// created on initialize and removed on cleanup.
    pub workspace: Option<PathBuf>,
}

/// Runs commands directly on the host, each in its own process group.
pub struct LocalBackend {
    lifecycle: Lifecycle,
    requested: Option<PathBuf>,
    workspace: String,
    temp: Option<TempDir>,
}

impl LocalBackend {
    pub fn new(options: LocalOptions) -> Self {
        let id = format!("local-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let workspace = options
            .workspace
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            lifecycle: Lifecycle::new(id),
            requested: options.workspace,
            workspace,
            temp: None,
        }
    }

    fn cwd(&self, options: &ExecuteOptions) -> PathBuf {
        match &options.cwd {
            Some(cwd) => PathBuf::from(resolve_path(&self.workspace, cwd)),
            None => PathBuf::from(&self.workspace),
        }
    }

    fn path(&self, path: &str) -> PathBuf {
        PathBuf::from(resolve_path(&self.workspace, path))
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn id(&self) -> &str {
        self.lifecycle.id()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn workspace(&self) -> &str {
        &self.workspace
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    #[instrument(skip(self), fields(backend = %self.lifecycle.id()))]
    async fn initialize(&mut self) -> Result<()> {
        self.lifecycle.begin_initialize()?;

        match &self.requested {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
            }
            None => {
                let temp = tempfile::Builder::new().prefix("ralph-").tempdir()?;
                self.workspace = temp.path().to_string_lossy().into_owned();
                self.temp = Some(temp);
            }
        }

        self.lifecycle.mark_ready();
        METRICS.inc_backends_provisioned();
        info!(workspace = %self.workspace, "local backend ready");
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        if !self.lifecycle.terminate() {
            return Ok(());
        }
        if let Some(temp) = self.temp.take() {
            debug!(workspace = %self.workspace, "removing temporary workspace");
            temp.close()?;
        }
        METRICS.inc_backends_cleaned_up();
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
        self.lifecycle.ensure_ready()?;
        let cwd = self.cwd(options);
        debug!(program = ?argv.first(), cwd = %cwd.display(), "local execute");

        let out = run_process(ProcessSpec {
            argv,
            cwd: Some(&cwd),
            env: Some(&options.env),
            stdin: None,
            timeout_ms: options.timeout_ms,
        })
        .await?;

        Ok(ExecuteResult {
            stdout: out.stdout_lossy(),
            stderr: out.stderr_lossy(),
            exit_code: out.exit_code,
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.lifecycle.ensure_ready()?;
        let target = self.path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents)
            .await
            .map_err(|err| file_error(&target, err))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.lifecycle.ensure_ready()?;
        let target = self.path(path);
        tokio::fs::read(&target)
            .await
            .map_err(|err| file_error(&target, err))
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        self.lifecycle.ensure_ready()?;
        Ok(tokio::fs::try_exists(self.path(path)).await?)
    }
}

fn file_error(path: &Path, err: std::io::Error) -> BackendError {
    if err.kind() == std::io::ErrorKind::NotFound {
        BackendError::NotFound(path.display().to_string())
    } else {
        BackendError::File {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn temp_workspace_is_removed_on_cleanup() {
        let mut backend = LocalBackend::new(LocalOptions::default());
        backend.initialize().await.unwrap();
        let ws = PathBuf::from(backend.workspace());
        assert!(ws.exists());
        assert!(ws
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("ralph-"));

        backend.cleanup().await.unwrap();
        assert!(!ws.exists());
        assert_eq!(backend.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn explicit_workspace_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = LocalBackend::new(LocalOptions {
            workspace: Some(dir.path().to_path_buf()),
        });
        backend.initialize().await.unwrap();
        backend.write_file("keep.txt", b"x").await.unwrap();
        backend.cleanup().await.unwrap();
        assert!(dir.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn execute_before_initialize_is_not_ready() {
        let backend = LocalBackend::new(LocalOptions::default());
        let err = backend
            .execute("true", &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotReady { .. }));
    }

    #[tokio::test]
    async fn reinitialize_after_cleanup_fails_fast() {
        let mut backend = LocalBackend::new(LocalOptions::default());
        backend.initialize().await.unwrap();
        backend.cleanup().await.unwrap();
        let err = backend.initialize().await.unwrap_err();
        assert!(matches!(err, BackendError::Terminated { .. }));
    }

    #[tokio::test]
    async fn failing_command_is_a_result_not_an_error() {
        let mut backend = LocalBackend::new(LocalOptions::default());
        backend.initialize().await.unwrap();
        let res = backend
            .execute("echo nope >&2; exit 7", &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(res.exit_code, 7);
        assert_eq!(res.stderr.trim(), "nope");
        backend.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn files_round_trip_bytes_and_relative_cwd() {
        let mut backend = LocalBackend::new(LocalOptions::default());
        backend.initialize().await.unwrap();

        let bytes = [0u8, 159, 146, 150, b'\n'];
        backend.write_file("nested/dir/blob.bin", &bytes).await.unwrap();
        assert!(backend.file_exists("nested/dir/blob.bin").await.unwrap());
        assert!(!backend.file_exists("nested/missing").await.unwrap());
        assert_eq!(
            backend.read_file("nested/dir/blob.bin").await.unwrap(),
            bytes
        );

        let res = backend
            .execute("ls", &ExecuteOptions::in_dir("nested/dir"))
            .await
            .unwrap();
        assert_eq!(res.stdout.trim(), "blob.bin");

        let err = backend.read_file("absent.txt").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));

        backend.cleanup().await.unwrap();
    }
}
