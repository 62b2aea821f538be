//! Clone, branch, commit, push and pull-request steps around a run.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use ralph_runtime::backend::resolve_path;
use ralph_runtime::process::{run_process, ProcessSpec};
use ralph_runtime::{BackendError, ExecuteOptions, ExecutionBackend, GitOps};
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::config::{GitConfig, RepositoryConfig};
use crate::progress::PROGRESS_FILE;
use crate::prompt::head_chars;

/// Directory the repository is cloned into, relative to the backend workspace.
pub const CLONE_DIR: &str = "repo";
const INSTALL_TIMEOUT_MS: u64 = 600_000;
const PR_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("a git token is required to {0}")]
    MissingToken(&'static str),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("repository setup failed: {0}")]
    Setup(String),

    #[error("pull request creation failed: {0}")]
    PullRequest(String),
}

/// Repository preparation before the loop and publication after it.
#[async_trait]
pub trait GitWorkflow: Send + Sync {
    /// Prepare the repository and return the working directory criteria run in.
    async fn setup(
        &self,
        backend: &dyn ExecutionBackend,
        repository: &RepositoryConfig,
        git: &GitConfig,
    ) -> Result<String, GitError>;

    /// Commit and push the agent's changes. No-op when nothing changed.
    async fn finalize(
        &self,
        backend: &dyn ExecutionBackend,
        workdir: &str,
        git: &GitConfig,
        summary: &str,
    ) -> Result<(), GitError>;

    /// Open a pull request for the pushed branch when configured to.
    async fn create_pull_request(
        &self,
        repository: &RepositoryConfig,
        git: &GitConfig,
        summary: &str,
    ) -> Result<Option<String>, GitError>;
}

/// Git over the active backend plus the `gh` CLI on the host for PRs.
pub struct StandardGitWorkflow {
    token: Option<String>,
    gh_bin: String,
}

impl StandardGitWorkflow {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            gh_bin: "gh".to_string(),
        }
    }

    pub fn with_gh_bin(mut self, bin: impl Into<String>) -> Self {
        self.gh_bin = bin.into();
        self
    }
}

#[async_trait]
impl GitWorkflow for StandardGitWorkflow {
    #[instrument(skip_all, fields(url = %repository.url, branch = %git.branch))]
    async fn setup(
        &self,
        backend: &dyn ExecutionBackend,
        repository: &RepositoryConfig,
        git: &GitConfig,
    ) -> Result<String, GitError> {
        let ops = GitOps::new(backend, CLONE_DIR);
        ops.clone_repo(
            &repository.url,
            CLONE_DIR,
            Some(repository.base_branch.as_str()),
            self.token.as_deref(),
        )
        .await?;
        ops.checkout(&git.branch, true).await?;
        ops.configure_user(&git.author_name, &git.author_email).await?;

        let workdir = match repository.working_dir.as_deref() {
            Some(dir) if !dir.is_empty() && dir != "." => resolve_path(CLONE_DIR, dir),
            _ => CLONE_DIR.to_string(),
        };

        if let Some(install) = repository.install_command.as_deref() {
            let out = backend
                .execute(
                    install,
                    &ExecuteOptions::in_dir(&workdir).with_timeout_ms(INSTALL_TIMEOUT_MS),
                )
                .await?;
            if !out.success() {
                let detail = if out.stderr.trim().is_empty() {
                    &out.stdout
                } else {
                    &out.stderr
                };
                return Err(GitError::Setup(format!(
                    "install command exited with {}: {}",
                    out.exit_code,
                    head_chars(detail.trim(), 1_000)
                )));
            }
        }

        info!(workdir = %workdir, "repository ready");
        Ok(workdir)
    }

    #[instrument(skip_all, fields(branch = %git.branch))]
    async fn finalize(
        &self,
        backend: &dyn ExecutionBackend,
        workdir: &str,
        git: &GitConfig,
        summary: &str,
    ) -> Result<(), GitError> {
        let ops = GitOps::new(backend, workdir);
        let status = ops.status().await?;
        let changed = status
            .files
            .iter()
            .filter(|f| !is_bookkeeping(&f.name))
            .count();
        if changed == 0 {
            info!("no changes to commit");
            return Ok(());
        }

        ops.add(&[
            ":/".to_string(),
            format!(":(exclude){PROGRESS_FILE}"),
            ":(exclude).ralph".to_string(),
        ])
        .await?;
        let message = git
            .commit_message
            .clone()
            .unwrap_or_else(|| commit_message(summary));
        ops.commit(
            &message,
            Some(git.author_name.as_str()),
            Some(git.author_email.as_str()),
        )
        .await?;
        ops.push(&git.branch, self.token.as_deref()).await?;
        info!(files = changed, "changes pushed");
        Ok(())
    }

    #[instrument(skip_all, fields(branch = %git.branch))]
    async fn create_pull_request(
        &self,
        repository: &RepositoryConfig,
        git: &GitConfig,
        summary: &str,
    ) -> Result<Option<String>, GitError> {
        if !git.create_pr {
            return Ok(None);
        }
        let Some(slug) = repository_slug(&repository.url) else {
            warn!(url = %repository.url, "not a GitHub repository; skipping pull request");
            return Ok(None);
        };
        let token = self
            .token
            .as_deref()
            .ok_or(GitError::MissingToken("create a pull request"))?;

        let title = git
            .pr_title
            .clone()
            .unwrap_or_else(|| format!("Ralph: {}", first_line(summary, 60)));
        let body = git.pr_body.clone().unwrap_or_else(|| {
            format!("Automated changes by the Ralph agent loop.\n\n{summary}\n")
        });
        let argv = vec![
            self.gh_bin.clone(),
            "pr".to_string(),
            "create".to_string(),
            "--repo".to_string(),
            slug,
            "--base".to_string(),
            repository.base_branch.clone(),
            "--head".to_string(),
            git.branch.clone(),
            "--title".to_string(),
            title,
            "--body".to_string(),
            body,
        ];
        let env = BTreeMap::from([("GH_TOKEN".to_string(), token.to_string())]);

        let out = run_process(ProcessSpec {
            argv: &argv,
            env: Some(&env),
            timeout_ms: PR_TIMEOUT_MS,
            ..Default::default()
        })
        .await
        .map_err(|e| GitError::PullRequest(e.to_string()))?;
        if !out.success() {
            let stderr = out.stderr_lossy();
            warn!(exit_code = out.exit_code, "gh pr create failed");
            return Err(GitError::PullRequest(format!(
                "gh exited with {}: {}",
                out.exit_code,
                stderr.trim()
            )));
        }

        let url = out
            .stdout_lossy()
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string);
        info!(url = ?url, "pull request created");
        Ok(url)
    }
}

/// Files Ralph itself writes into the working directory.
fn is_bookkeeping(name: &str) -> bool {
    let name = name.trim_matches('"');
    let base = name.rsplit('/').find(|s| !s.is_empty()).unwrap_or(name);
    base == PROGRESS_FILE || name == ".ralph/" || name.starts_with(".ralph/") || name.contains("/.ralph/")
}

fn first_line(text: &str, max: usize) -> &str {
    head_chars(text.lines().next().unwrap_or_default().trim(), max)
}

/// Default commit message: `feat: ` plus the summary's first line.
pub fn commit_message(summary: &str) -> String {
    let line = first_line(summary, 50);
    if line.is_empty() {
        "feat: changes from Ralph agent loop".to_string()
    } else {
        format!("feat: {line}")
    }
}

/// `owner/name` of a GitHub HTTPS or SSH URL.
pub fn repository_slug(url: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"github\.com[:/]([^/\s]+/[^/\s]+?)(?:\.git)?/?$").ok())
        .as_ref()?;
    re.captures(url.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
