//! The orchestration driver: validate, pick a scheduler, aggregate.

use std::sync::Arc;
use std::time::Instant;

use ralph_runtime::{BackendFactory, Credentials, DefaultBackendFactory, METRICS};
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::agent::{Agent, CommandAgent};
use crate::config::{RalphConfig, RunMode};
use crate::error::OrchestrationError;
use crate::git_workflow::{GitWorkflow, StandardGitWorkflow};
use crate::obs;
use crate::result::{CriterionPass, OrchestrationResult, RunStatus};
use crate::scheduler::{run_parallel, run_sequential, RunContext, RunReport};
use crate::telemetry::{NoopTelemetry, Telemetry};

/// Runs one configuration to an [`OrchestrationResult`].
///
/// Collaborators default to [`CommandAgent`], [`DefaultBackendFactory`] and
/// [`StandardGitWorkflow`] built from the configuration and credentials; each
/// can be replaced before calling [`run`](Orchestrator::run).
pub struct Orchestrator {
    config: RalphConfig,
    credentials: Credentials,
    agent: Option<Arc<dyn Agent>>,
    factory: Option<Arc<dyn BackendFactory>>,
    git: Option<Arc<dyn GitWorkflow>>,
    telemetry: Arc<dyn Telemetry>,
}

impl Orchestrator {
    pub fn new(config: RalphConfig, credentials: Credentials) -> Self {
        Self {
            config: config.normalized(),
            credentials,
            agent: None,
            factory: None,
            git: None,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_backend_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_git_workflow(mut self, git: Arc<dyn GitWorkflow>) -> Self {
        self.git = Some(git);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &RalphConfig {
        &self.config
    }

    /// Execute the run. Never fails: every problem resolves to a result with
    /// one of the four statuses.
    pub async fn run(&self) -> OrchestrationResult {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let report = self
            .execute(&run_id)
            .instrument(obs::run_span(&run_id))
            .await;

        let result = OrchestrationResult {
            run_id,
            status: report.status,
            total_iterations: report.iterations,
            passes: report.passes,
            tokens_used: report.usage.total_tokens(),
            cost_usd: report.usage.cost_usd,
            duration_ms: started.elapsed().as_millis() as u64,
            criteria_results: report.criteria_results,
            pr_url: report.pr_url,
            error: report.error,
        };
        self.telemetry.run_finished(&result);
        METRICS.flush();
        result
    }

    async fn execute(&self, run_id: &str) -> RunReport {
        let ctx = match self.context() {
            Ok(ctx) => ctx,
            Err(err) => {
                obs::emit_flow_error("*", &err);
                return self.error_report(err);
            }
        };

        let mode = ctx.config.mode;
        let criteria = ctx.config.criteria.clone();
        self.telemetry
            .run_started(run_id, &mode.to_string(), criteria.len());
        info!(%mode, runtime = %ctx.config.runtime.kind, criteria = criteria.len(), "run started");

        match mode {
            RunMode::Sequential => run_sequential(&ctx, criteria).await,
            RunMode::Parallel => run_parallel(&ctx, criteria).await,
        }
    }

    /// Validate the configuration and resolve collaborators. No backend is
    /// created here.
    fn context(&self) -> Result<RunContext, OrchestrationError> {
        self.config.validate()?;

        let factory: Arc<dyn BackendFactory> = match &self.factory {
            Some(factory) => Arc::clone(factory),
            None => Arc::new(DefaultBackendFactory::new(
                self.config.runtime.clone(),
                &self.credentials,
            )?),
        };
        let agent = self.agent.clone().unwrap_or_else(|| {
            Arc::new(CommandAgent::new(
                self.config.agent_command.clone(),
                self.config.agent_timeout_ms,
                self.credentials.anthropic_api_key.clone(),
            ))
        });
        let git = self.git.clone().unwrap_or_else(|| {
            Arc::new(StandardGitWorkflow::new(self.credentials.git_token.clone()))
        });

        Ok(RunContext {
            config: Arc::new(self.config.clone()),
            agent,
            factory,
            git,
            telemetry: Arc::clone(&self.telemetry),
        })
    }

    fn error_report(&self, err: OrchestrationError) -> RunReport {
        RunReport {
            status: RunStatus::Error,
            passes: self
                .config
                .criteria
                .iter()
                .map(|c| CriterionPass {
                    id: c.id.clone(),
                    passes: c.passes(),
                })
                .collect(),
            iterations: 0,
            usage: Default::default(),
            criteria_results: None,
            pr_url: None,
            error: Some(err.to_string()),
        }
    }
}
