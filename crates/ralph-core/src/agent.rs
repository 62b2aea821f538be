//! Code-generation agent collaborator.
//!
//! The agent is opaque: it receives a task prompt and a working directory and
//! returns free-form output plus token usage. [`CommandAgent`] runs a CLI
//! inside the active backend.

use std::sync::OnceLock;

use async_trait::async_trait;
use ralph_runtime::backend::resolve_path;
use ralph_runtime::{BackendError, ExecuteOptions, ExecutionBackend};
use regex::Regex;
use tracing::{debug, instrument};

use crate::result::TokenUsage;

/// Where the prompt is written, relative to the working directory.
pub const TASK_FILE: &str = ".ralph/task.md";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub task: String,
    pub workdir: String,
    pub failure_context: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    pub output: String,
    pub usage: TokenUsage,
}

/// Invokes the code-generation agent for one `Generating` step.
///
/// Failures surface as backend errors; the state machine folds them into the
/// next iteration's failure context rather than aborting.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(
        &self,
        backend: &dyn ExecutionBackend,
        request: &AgentRequest,
    ) -> Result<AgentResponse, BackendError>;
}

/// Runs an agent CLI through the backend.
///
/// Each argv element may use the placeholders `{model}`, `{task_file}` and
/// `{workdir}`. The same values are exported as `RALPH_MODEL`,
/// `RALPH_TASK_FILE` and `RALPH_WORKDIR`. Usage is read from a
/// `__USAGE_JSON__{...}__USAGE_JSON__` marker in stdout.
pub struct CommandAgent {
    command: Vec<String>,
    timeout_ms: u64,
    api_key: Option<String>,
}

impl CommandAgent {
    pub fn new(command: Option<Vec<String>>, timeout_ms: u64, api_key: Option<String>) -> Self {
        Self {
            command: command.unwrap_or_else(Self::default_command),
            timeout_ms,
            api_key,
        }
    }

    pub fn default_command() -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"claude --print --dangerously-skip-permissions --model "$RALPH_MODEL" < "$RALPH_TASK_FILE""#
                .to_string(),
        ]
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

#[async_trait]
impl Agent for CommandAgent {
    #[instrument(skip(self, backend, request), fields(model = %request.model))]
    async fn run(
        &self,
        backend: &dyn ExecutionBackend,
        request: &AgentRequest,
    ) -> Result<AgentResponse, BackendError> {
        let task_file = resolve_path(&request.workdir, TASK_FILE);
        backend.write_file(&task_file, request.task.as_bytes()).await?;

        let argv: Vec<String> = self
            .command
            .iter()
            .map(|arg| {
                arg.replace("{model}", &request.model)
                    .replace("{task_file}", &task_file)
                    .replace("{workdir}", &request.workdir)
            })
            .collect();

        let mut options = ExecuteOptions::in_dir(&request.workdir)
            .with_timeout_ms(self.timeout_ms)
            .with_env("RALPH_MODEL", &request.model)
            .with_env("RALPH_TASK_FILE", &task_file)
            .with_env("RALPH_WORKDIR", &request.workdir);
        if let Some(key) = &self.api_key {
            options = options.with_env("ANTHROPIC_API_KEY", key);
        }

        let out = backend.execute_argv(&argv, &options).await?;
        if out.exit_code != 0 {
            return Err(BackendError::CommandFailed {
                program: argv.first().cloned().unwrap_or_default(),
                exit_code: out.exit_code,
                stderr: crate::prompt::head_chars(out.stderr.trim(), 1_000).to_string(),
            });
        }

        let (output, usage) = parse_usage(&out.stdout);
        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "agent finished"
        );
        Ok(AgentResponse { output, usage })
    }
}

/// Split the usage marker out of agent output. Missing or malformed markers
/// yield zero usage.
pub fn parse_usage(stdout: &str) -> (String, TokenUsage) {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = RE
        .get_or_init(|| Regex::new(r"(?s)__USAGE_JSON__(\{.*?\})__USAGE_JSON__").ok())
        .as_ref()
    else {
        return (stdout.to_string(), TokenUsage::default());
    };

    let usage = re
        .captures_iter(stdout)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| serde_json::from_str::<TokenUsage>(m.as_str()).ok())
        .unwrap_or_default();
    let output = re.replace_all(stdout, "").trim().to_string();
    (output, usage)
}
