//! Host process runner shared by the local and container backends.
//!
//! Commands are spawned from an argument vector (never a concatenated shell
//! string) in their own process group, so a timeout can kill the whole tree.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use command_group::AsyncCommandGroup;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{BackendError, Result};

/// Exit code reported when a command is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const MAX_TIMEOUT_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

/// How long output may keep flowing after a killed group before it is dropped.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Exit code `timeout --signal=KILL` leaves behind when it kills its child.
pub const KILLED_EXIT_CODE: i32 = 137;

/// Map a remote `timeout --signal=KILL` result onto [`TIMEOUT_EXIT_CODE`].
///
/// 137 only means "timed out" when the command actually ran for its whole
/// budget; earlier it is a genuine SIGKILL (an OOM kill, say) and is kept.
pub fn timeout_exit_code(exit_code: i32, elapsed: Duration, timeout_ms: u64) -> i32 {
    let deadline_reached = elapsed >= Duration::from_millis(timeout_ms);
    if exit_code == TIMEOUT_EXIT_CODE || (exit_code == KILLED_EXIT_CODE && deadline_reached) {
        TIMEOUT_EXIT_CODE
    } else {
        exit_code
    }
}

/// Raw output of a host process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A single process invocation.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec<'a> {
    pub argv: &'a [String],
    pub cwd: Option<&'a Path>,
    pub env: Option<&'a BTreeMap<String, String>>,
    pub stdin: Option<&'a [u8]>,
    pub timeout_ms: u64,
}

/// Run a process to completion or until its timeout elapses.
///
/// On timeout the process group is killed and [`TIMEOUT_EXIT_CODE`] is
/// returned together with whatever output was captured so far. A non-zero
/// exit is a normal result; only spawn and pipe failures are errors.
pub async fn run_process(spec: ProcessSpec<'_>) -> Result<ProcessOutput> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| BackendError::InvalidArgument("empty argument vector".to_string()))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .kill_on_drop(true)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = spec.cwd {
        command.current_dir(cwd);
    }
    if let Some(env) = spec.env {
        command.envs(env);
    }

    let mut child = command.group_spawn().map_err(|source| BackendError::Spawn {
        program: program.clone(),
        source,
    })?;

    let mut stdout = child.inner().stdout.take().map(|pipe| tokio::spawn(drain(pipe)));
    let mut stderr = child.inner().stderr.take().map(|pipe| tokio::spawn(drain(pipe)));
    let stdin = match (child.inner().stdin.take(), spec.stdin) {
        (Some(mut pipe), Some(data)) => {
            let data = data.to_vec();
            Some(tokio::spawn(async move {
                pipe.write_all(&data).await?;
                pipe.shutdown().await
            }))
        }
        _ => None,
    };

    let deadline = Instant::now() + Duration::from_millis(spec.timeout_ms.min(MAX_TIMEOUT_MS));
    let waited = tokio::time::timeout_at(deadline, child.wait()).await;
    let (mut exit_code, mut timed_out) = match waited {
        Ok(status) => {
            let code = status?.code().unwrap_or(-1);
            // Anything the command left running in its group still holds the pipes.
            if let Err(err) = child.start_kill() {
                debug!(program = %program, error = %err, "no group members left to kill");
            }
            (code, false)
        }
        Err(_) => {
            warn!(program = %program, timeout_ms = spec.timeout_ms, "process timed out, killing group");
            if let Err(err) = child.kill().await {
                debug!(program = %program, error = %err, "kill after timeout failed");
            }
            (TIMEOUT_EXIT_CODE, true)
        }
    };

    // A descendant that escaped the group can keep a pipe open indefinitely,
    // so draining shares the command's deadline.
    let drain_deadline = deadline.max(Instant::now() + DRAIN_GRACE);
    let drained = tokio::time::timeout_at(drain_deadline, async {
        tokio::join!(collect(stdout.as_mut()), collect(stderr.as_mut()))
    })
    .await;
    let (stdout_buf, stderr_buf) = match drained {
        Ok(buffers) => buffers,
        Err(_) => {
            warn!(program = %program, timeout_ms = spec.timeout_ms, "output pipes still open at deadline");
            if let Err(err) = child.start_kill() {
                debug!(program = %program, error = %err, "kill after drain timeout failed");
            }
            for task in [&stdout, &stderr].into_iter().flatten() {
                task.abort();
            }
            exit_code = TIMEOUT_EXIT_CODE;
            timed_out = true;
            (Vec::new(), Vec::new())
        }
    };

    if let Some(task) = stdin {
        if task.is_finished() {
            if let Ok(Err(err)) = task.await {
                // Broken pipe is expected when the process exits without reading.
                debug!(program = %program, error = %err, "stdin write incomplete");
            }
        } else {
            task.abort();
        }
    }

    Ok(ProcessOutput {
        stdout: stdout_buf,
        stderr: stderr_buf,
        exit_code,
        timed_out,
    })
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn collect(task: Option<&mut JoinHandle<std::io::Result<Vec<u8>>>>) -> Vec<u8> {
    match task {
        Some(handle) => handle.await.ok().and_then(|r| r.ok()).unwrap_or_default(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let argv = argv(&["sh", "-c", "echo out; echo err >&2; exit 3"]);
        let out = run_process(ProcessSpec {
            argv: &argv,
            timeout_ms: 5_000,
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout_lossy().trim(), "out");
        assert_eq!(out.stderr_lossy().trim(), "err");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let argv = argv(&["cat"]);
        let out = run_process(ProcessSpec {
            argv: &argv,
            stdin: Some(b"hello\x00bytes"),
            timeout_ms: 5_000,
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(out.stdout, b"hello\x00bytes");
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_synthetic_code() {
        let argv = argv(&["sh", "-c", "sleep 30"]);
        let started = std::time::Instant::now();
        let out = run_process(ProcessSpec {
            argv: &argv,
            timeout_ms: 200,
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn background_child_does_not_outlive_the_command() {
        let argv = argv(&["sh", "-c", "sleep 8 & echo hi"]);
        let started = std::time::Instant::now();
        let out = run_process(ProcessSpec {
            argv: &argv,
            timeout_ms: 500,
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        assert_eq!(out.stdout_lossy().trim(), "hi");
    }

    #[tokio::test]
    async fn timeout_bounds_a_group_that_keeps_pipes_open() {
        let argv = argv(&["sh", "-c", "sleep 8 & sleep 8"]);
        let started = std::time::Instant::now();
        let out = run_process(ProcessSpec {
            argv: &argv,
            timeout_ms: 300,
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[test]
    fn killed_exit_code_is_a_timeout_only_at_the_deadline() {
        let limit = 2_000;
        assert_eq!(
            timeout_exit_code(KILLED_EXIT_CODE, Duration::from_millis(2_000), limit),
            TIMEOUT_EXIT_CODE
        );
        assert_eq!(
            timeout_exit_code(KILLED_EXIT_CODE, Duration::from_millis(300), limit),
            KILLED_EXIT_CODE
        );
        assert_eq!(timeout_exit_code(124, Duration::ZERO, limit), TIMEOUT_EXIT_CODE);
        assert_eq!(timeout_exit_code(1, Duration::from_secs(5), limit), 1);
    }

    #[tokio::test]
    async fn env_overlay_is_visible() {
        let argv = argv(&["sh", "-c", "printf %s \"$RALPH_OVERLAY\""]);
        let mut env = BTreeMap::new();
        env.insert("RALPH_OVERLAY".to_string(), "it works".to_string());
        let out = run_process(ProcessSpec {
            argv: &argv,
            env: Some(&env),
            timeout_ms: 5_000,
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(out.stdout_lossy(), "it works");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let argv = argv(&["ralph-definitely-not-a-binary"]);
        let err = run_process(ProcessSpec {
            argv: &argv,
            timeout_ms: 1_000,
            ..Default::default()
        })
        .await
        .unwrap_err();

        assert!(matches!(err, BackendError::Spawn { .. }));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let err = run_process(ProcessSpec {
            argv: &[],
            timeout_ms: 1_000,
            ..Default::default()
        })
        .await
        .unwrap_err();

        assert!(matches!(err, BackendError::InvalidArgument(_)));
    }
}
