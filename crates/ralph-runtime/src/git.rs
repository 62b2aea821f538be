//! Version-control operations over any backend, expressed as argument vectors.
//!
//! Branch names, URLs, messages and tokens never pass through a shell. Tokens
//! travel in the `GIT_TOKEN` environment overlay and are read by a constant
//! credential helper.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{resolve_path, ExecuteOptions, ExecuteResult, ExecutionBackend};
use crate::error::{BackendError, Result};

pub const DEFAULT_AUTHOR_NAME: &str = "Ralph Agent";
pub const DEFAULT_AUTHOR_EMAIL: &str = "ralph@example.com";

const GIT_TIMEOUT_MS: u64 = 300_000;
const TOKEN_ENV: &str = "GIT_TOKEN";
const CREDENTIAL_HELPER: &str =
    "credential.helper=!f() { echo username=x-access-token; echo \"password=$GIT_TOKEN\"; }; f";

/// One entry of `git status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitFileStatus {
    pub name: String,
    /// Two-letter porcelain code, e.g. `" M"` or `"??"`.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub branch: String,
    pub files: Vec<GitFileStatus>,
    pub clean: bool,
}

/// Git operations bound to a backend and a repository directory.
pub struct GitOps<'a> {
    backend: &'a dyn ExecutionBackend,
    repo_dir: String,
}

impl<'a> GitOps<'a> {
    /// Operate on the repository at `repo_dir` (relative to the backend workspace).
    pub fn new(backend: &'a dyn ExecutionBackend, repo_dir: impl Into<String>) -> Self {
        Self {
            backend,
            repo_dir: repo_dir.into(),
        }
    }

    pub fn repo_dir(&self) -> &str {
        &self.repo_dir
    }

    async fn git(
        &self,
        operation: &str,
        args: Vec<String>,
        cwd: &str,
        token: Option<&str>,
    ) -> Result<ExecuteResult> {
        let mut argv = vec!["git".to_string()];
        let mut options = ExecuteOptions::in_dir(cwd).with_timeout_ms(GIT_TIMEOUT_MS);
        if let Some(token) = token {
            argv.push("-c".to_string());
            argv.push(CREDENTIAL_HELPER.to_string());
            options = options.with_env(TOKEN_ENV, token);
        }
        argv.extend(args);
        debug!(operation, cwd, "git");

        let out = self.backend.execute_argv(&argv, &options).await?;
        if out.exit_code != 0 {
            return Err(BackendError::Git {
                operation: operation.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    /// Clone `url` into `path` (relative to the workspace).
    pub async fn clone_repo(
        &self,
        url: &str,
        path: &str,
        branch: Option<&str>,
        token: Option<&str>,
    ) -> Result<()> {
        let mut args = vec!["clone".to_string()];
        if let Some(branch) = branch {
            validate_ref(branch)?;
            args.push("--branch".to_string());
            args.push(branch.to_string());
        }
        args.extend(["--".to_string(), url.to_string(), path.to_string()]);
        let workspace = self.backend.workspace().to_string();
        self.git("clone", args, &workspace, token).await?;
        Ok(())
    }

    pub async fn checkout(&self, branch: &str, create: bool) -> Result<()> {
        validate_ref(branch)?;
        let mut args = vec!["checkout".to_string()];
        if create {
            args.push("-b".to_string());
        }
        args.push(branch.to_string());
        self.git("checkout", args, &self.repo_dir, None).await?;
        Ok(())
    }

    /// Stage `files`; pathspecs may include exclusions like `:(exclude)x`.
    pub async fn add(&self, files: &[String]) -> Result<()> {
        let mut args = vec!["add".to_string(), "--".to_string()];
        args.extend(files.iter().cloned());
        self.git("add", args, &self.repo_dir, None).await?;
        Ok(())
    }

    pub async fn commit(
        &self,
        message: &str,
        author: Option<&str>,
        email: Option<&str>,
    ) -> Result<()> {
        let args = vec![
            "-c".to_string(),
            format!("user.name={}", author.unwrap_or(DEFAULT_AUTHOR_NAME)),
            "-c".to_string(),
            format!("user.email={}", email.unwrap_or(DEFAULT_AUTHOR_EMAIL)),
            "commit".to_string(),
            "-m".to_string(),
            message.to_string(),
        ];
        self.git("commit", args, &self.repo_dir, None).await?;
        Ok(())
    }

    pub async fn push(&self, branch: &str, token: Option<&str>) -> Result<()> {
        validate_ref(branch)?;
        let args = vec![
            "push".to_string(),
            "-u".to_string(),
            "origin".to_string(),
            branch.to_string(),
        ];
        self.git("push", args, &self.repo_dir, token).await?;
        Ok(())
    }

    /// Set the repository-local identity used for later commits.
    pub async fn configure_user(&self, name: &str, email: &str) -> Result<()> {
        for (key, value) in [("user.name", name), ("user.email", email)] {
            let args = vec!["config".to_string(), key.to_string(), value.to_string()];
            self.git("config", args, &self.repo_dir, None).await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<GitStatus> {
        let args = vec![
            "status".to_string(),
            "--porcelain=v1".to_string(),
            "--branch".to_string(),
        ];
        let out = self.git("status", args, &self.repo_dir, None).await?;
        Ok(parse_status(&out.stdout))
    }

    /// Create a worktree for a new `branch` under `<workspace>/.worktrees/`.
    pub async fn create_worktree(&self, branch: &str) -> Result<String> {
        validate_ref(branch)?;
        let path = resolve_path(
            self.backend.workspace(),
            &format!(".worktrees/{branch}"),
        );
        let args = vec![
            "worktree".to_string(),
            "add".to_string(),
            "-b".to_string(),
            branch.to_string(),
            "--".to_string(),
            path.clone(),
        ];
        self.git("worktree add", args, &self.repo_dir, None).await?;
        Ok(path)
    }

    pub async fn remove_worktree(&self, path: &str) -> Result<()> {
        let args = vec![
            "worktree".to_string(),
            "remove".to_string(),
            "--force".to_string(),
            "--".to_string(),
            path.to_string(),
        ];
        self.git("worktree remove", args, &self.repo_dir, None).await?;
        Ok(())
    }
}

/// Reject ref names git would misread as options or that it refuses anyway.
pub fn validate_ref(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('-')
        || name.contains("..")
        || name.ends_with('/')
        || name.ends_with(".lock")
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if bad {
        return Err(BackendError::InvalidArgument(format!(
            "invalid branch name: {name:?}"
        )));
    }
    Ok(())
}

fn parse_status(output: &str) -> GitStatus {
    let mut branch = String::new();
    let mut files = Vec::new();
    for line in output.lines() {
        if let Some(head) = line.strip_prefix("## ") {
            let head = head.split("...").next().unwrap_or(head);
            branch = head
                .strip_prefix("No commits yet on ")
                .unwrap_or(head)
                .trim()
                .to_string();
        } else if line.len() > 3 {
            files.push(GitFileStatus {
                status: line[..2].to_string(),
                name: line[3..].to_string(),
            });
        }
    }
    let clean = files.is_empty();
    GitStatus {
        branch,
        files,
        clean,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_porcelain_status() {
        let status = parse_status("## feature/x...origin/feature/x [ahead 1]\n M src/lib.rs\n?? new.txt\n");
        assert_eq!(status.branch, "feature/x");
        assert!(!status.clean);
        assert_eq!(status.files.len(), 2);
        assert_eq!(status.files[0].status, " M");
        assert_eq!(status.files[0].name, "src/lib.rs");
        assert_eq!(status.files[1].status, "??");
    }

    #[test]
    fn parses_clean_fresh_repo() {
        let status = parse_status("## No commits yet on main\n");
        assert_eq!(status.branch, "main");
        assert!(status.clean);
    }

    #[test]
    fn rejects_option_like_and_malformed_refs() {
        for name in ["", "-rf", "a..b", "with space", "x;y\n", "end/", "q?"] {
            assert!(validate_ref(name).is_err(), "{name:?}");
        }
        validate_ref("feature/ralph/crit-1").unwrap();
    }
}
