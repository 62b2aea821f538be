//! Run configuration (`ralph.json`) and its validation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ralph_runtime::{RuntimeConfig, RuntimeKind, DEFAULT_EXECUTE_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::budget::RunBudget;
use crate::criterion::Criterion;

pub const DEFAULT_MODEL: &str = "haiku";
pub const DEFAULT_FEATURE_BRANCH: &str = "feature/ralph";
pub const DEFAULT_AGENT_TIMEOUT_MS: u64 = 600_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Sequential,
    Parallel,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunMode::Sequential => "sequential",
            RunMode::Parallel => "parallel",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_tokens: u64,
    pub max_cost_usd: Option<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            max_cost_usd: None,
        }
    }
}

/// Remote repository the agent works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub url: String,
    #[serde(default = "default_base_branch", alias = "branch")]
    pub base_branch: String,
    /// Subdirectory of the clone the criteria run in.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Dependency install command run once after cloning.
    #[serde(default)]
    pub install_command: Option<String>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

/// Feature-branch and pull-request settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    #[serde(alias = "feature_branch")]
    pub branch: String,
    pub create_pr: bool,
    pub commit_message: Option<String>,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    #[serde(alias = "commit_author")]
    pub author_name: String,
    #[serde(alias = "commit_email")]
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch: DEFAULT_FEATURE_BRANCH.to_string(),
            create_pr: false,
            commit_message: None,
            pr_title: None,
            pr_body: None,
            author_name: ralph_runtime::git::DEFAULT_AUTHOR_NAME.to_string(),
            author_email: ralph_runtime::git::DEFAULT_AUTHOR_EMAIL.to_string(),
        }
    }
}

impl GitConfig {
    /// Settings for one criterion's isolated flow in parallel mode.
    pub fn for_criterion(&self, criterion: &Criterion) -> GitConfig {
        let mut body = format!("## {}\n", criterion.description);
        if !criterion.steps.is_empty() {
            body.push_str("\n### Steps\n");
            for step in &criterion.steps {
                body.push_str(&format!("- {step}\n"));
            }
        }
        body.push_str(&format!(
            "\nVerified by: `{}`\n",
            criterion.backpressure
        ));
        GitConfig {
            branch: format!("{}/{}", self.branch, criterion.id),
            commit_message: Some(format!("feat({}): {}", criterion.id, criterion.description)),
            pr_title: Some(format!("{}: {}", criterion.id, criterion.description)),
            pr_body: Some(body),
            ..self.clone()
        }
    }
}

/// Run settings older `ralph.json` files group under `execution`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub mode: Option<RunMode>,
    pub runtime: Option<RuntimeKind>,
    pub max_concurrent: Option<usize>,
    pub model: Option<String>,
}

/// A completion check of a single-task config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskCheck {
    FileExists { path: String },
    CommandSucceeds { command: String },
}

/// Id of the criterion a single-task config is turned into.
pub const TASK_CRITERION_ID: &str = "task";

/// Complete configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RalphConfig {
    #[serde(alias = "acceptance_criteria")]
    pub criteria: Vec<Criterion>,
    pub mode: RunMode,
    pub runtime: RuntimeConfig,
    pub max_concurrent: usize,
    pub max_iterations_per_criterion: u32,
    /// Aggregate cap for sequential runs; defaults to per-criterion cap times
    /// the number of criteria.
    pub max_iterations: Option<u32>,
    pub budget: BudgetConfig,
    pub model: String,
    pub feedback_commands: Vec<String>,
    pub verify_timeout_ms: u64,
    pub agent_timeout_ms: u64,
    /// Agent argv; see [`CommandAgent`](crate::agent::CommandAgent).
    pub agent_command: Option<Vec<String>>,
    pub repository: Option<RepositoryConfig>,
    pub git: Option<GitConfig>,
    /// Folded into the top-level fields by [`RalphConfig::normalized`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSection>,
    /// Single-task form: one prompt proven done by `legacy_criteria`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub legacy_criteria: Vec<TaskCheck>,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            mode: RunMode::Sequential,
            runtime: RuntimeConfig::default(),
            max_concurrent: 3,
            max_iterations_per_criterion: 3,
            max_iterations: None,
            budget: BudgetConfig::default(),
            model: DEFAULT_MODEL.to_string(),
            feedback_commands: Vec::new(),
            verify_timeout_ms: DEFAULT_EXECUTE_TIMEOUT_MS,
            agent_timeout_ms: DEFAULT_AGENT_TIMEOUT_MS,
            agent_command: None,
            repository: None,
            git: None,
            execution: None,
            task: None,
            legacy_criteria: Vec::new(),
        }
    }
}

impl RalphConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: RalphConfig = serde_json::from_str(text)?;
        Ok(config.normalized())
    }

    /// Fold the older layouts into the current one: `execution.*` settings
    /// override their top-level counterparts, and a `task` with
    /// `legacy_criteria` becomes a single criterion whose backpressure
    /// command runs every check. Idempotent.
    pub fn normalized(mut self) -> Self {
        if let Some(execution) = self.execution.take() {
            if let Some(mode) = execution.mode {
                self.mode = mode;
            }
            if let Some(kind) = execution.runtime {
                self.runtime.kind = kind;
            }
            if let Some(max_concurrent) = execution.max_concurrent {
                self.max_concurrent = max_concurrent;
            }
            if let Some(model) = execution.model {
                self.model = model;
            }
        }

        let task = self.task.take();
        let checks = std::mem::take(&mut self.legacy_criteria);
        match task {
            Some(task) if self.criteria.is_empty() && !checks.is_empty() => {
                if let Some(cap) = self.max_iterations {
                    self.max_iterations_per_criterion = cap;
                }
                self.criteria = vec![Criterion::new(
                    TASK_CRITERION_ID,
                    task,
                    task_checks_command(&checks),
                )];
            }
            Some(_) if !self.criteria.is_empty() => {
                warn!("config has both criteria and a single task; the task is ignored");
            }
            Some(task) => {
                // Left for validate() to report.
                self.task = Some(task);
                self.legacy_criteria = checks;
            }
            None if !checks.is_empty() => self.legacy_criteria = checks,
            None => {}
        }
        self
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn with_criteria(mut self, criteria: Vec<Criterion>) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_runtime(mut self, kind: RuntimeKind) -> Self {
        self.runtime.kind = kind;
        self
    }

    /// Effective aggregate iteration cap for a sequential run.
    pub fn aggregate_iteration_cap(&self) -> u32 {
        self.max_iterations.unwrap_or_else(|| {
            self.max_iterations_per_criterion
                .saturating_mul(self.criteria.len() as u32)
        })
    }

    /// Budget shared by every criterion of a sequential run.
    pub fn run_budget(&self) -> RunBudget {
        RunBudget::new(
            Some(self.budget.max_tokens),
            self.budget.max_cost_usd,
            Some(self.aggregate_iteration_cap()),
        )
    }

    /// Report every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.task.is_some() {
            problems.push("task requires at least one entry in legacy_criteria".to_string());
        }
        if !self.legacy_criteria.is_empty() {
            problems.push("legacy_criteria requires a task".to_string());
        }
        if self.criteria.is_empty() {
            problems.push("at least one criterion is required".to_string());
        }
        let mut seen = HashSet::new();
        for (i, c) in self.criteria.iter().enumerate() {
            if c.id.trim().is_empty() {
                problems.push(format!("criteria[{i}]: id must not be empty"));
            } else if !seen.insert(c.id.as_str()) {
                problems.push(format!("criteria[{i}]: duplicate id {:?}", c.id));
            }
            if c.backpressure.trim().is_empty() {
                problems.push(format!(
                    "criteria[{i}] ({}): backpressure command must not be empty",
                    c.id
                ));
            }
            if self.mode == RunMode::Parallel && self.git.is_some() {
                let branch = format!(
                    "{}/{}",
                    self.git.as_ref().map(|g| g.branch.as_str()).unwrap_or_default(),
                    c.id
                );
                if ralph_runtime::git::validate_ref(&branch).is_err() {
                    problems.push(format!(
                        "criteria[{i}]: id {:?} does not form a valid branch name",
                        c.id
                    ));
                }
            }
        }

        if self.max_concurrent == 0 {
            problems.push("max_concurrent must be at least 1".to_string());
        }
        if self.max_iterations_per_criterion == 0 {
            problems.push("max_iterations_per_criterion must be at least 1".to_string());
        }
        if self.max_iterations == Some(0) {
            problems.push("max_iterations must be at least 1".to_string());
        }
        if self.verify_timeout_ms == 0 || self.agent_timeout_ms == 0 {
            problems.push("timeouts must be greater than zero".to_string());
        }
        if self.model.trim().is_empty() {
            problems.push("model must not be empty".to_string());
        }
        if matches!(&self.agent_command, Some(argv) if argv.is_empty()) {
            problems.push("agent_command must not be empty".to_string());
        }

        match (&self.repository, &self.git) {
            (None, Some(git)) if git.create_pr => {
                problems.push("git.create_pr requires repository.url".to_string())
            }
            (None, Some(_)) => problems.push("git settings require a repository".to_string()),
            (Some(repo), git) => {
                if repo.url.trim().is_empty() {
                    problems.push("repository.url must not be empty".to_string());
                }
                if git.is_none() {
                    problems.push("repository requires git settings".to_string());
                }
                if let Some(git) = git {
                    if ralph_runtime::git::validate_ref(&git.branch).is_err() {
                        problems.push(format!("git.branch {:?} is not a valid branch", git.branch));
                    }
                }
            }
            (None, None) => {}
        }

        if self.mode == RunMode::Parallel
            && self.runtime.kind == RuntimeKind::Local
            && self.runtime.local.workspace.is_some()
        {
            problems.push(
                "parallel mode needs isolated workspaces; remove runtime.local.workspace"
                    .to_string(),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// One shell script that runs every check, names each failure on stdout,
/// and exits non-zero if any failed.
fn task_checks_command(checks: &[TaskCheck]) -> String {
    let mut lines = vec!["ralph_failed=0".to_string()];
    for check in checks {
        let (test, label) = match check {
            TaskCheck::FileExists { path } => (
                format!("test -e {}", quote(path)),
                format!("FAIL file_exists: {path}"),
            ),
            TaskCheck::CommandSucceeds { command } => (
                format!("( {command}\n)"),
                format!("FAIL command_succeeds: {command}"),
            ),
        };
        lines.push(format!(
            "{test} || {{ echo {}; ralph_failed=1; }}",
            quote(&label)
        ));
    }
    lines.push("exit $ralph_failed".to_string());
    lines.join("\n")
}

fn quote(word: &str) -> String {
    let word = word.replace('\0', "");
    shlex::try_quote(&word)
        .map(|quoted| quoted.into_owned())
        .unwrap_or(word)
}
