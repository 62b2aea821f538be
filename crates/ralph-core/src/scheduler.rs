//! Sequential and parallel scheduling of criterion flows.
//!
//! Both policies own the `initialize`/`cleanup` pairing of every backend they
//! create: the flow body runs under `catch_unwind` and cleanup runs afterwards
//! whatever the body did.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use ralph_runtime::{BackendFactory, ExecutionBackend};
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};

use crate::agent::Agent;
use crate::budget::RunBudget;
use crate::config::RalphConfig;
use crate::criterion::Criterion;
use crate::error::{OrchestrationError, Result};
use crate::git_workflow::GitWorkflow;
use crate::machine::{CriterionMachine, LoopSettings, MachineOutcome};
use crate::obs;
use crate::progress::ProgressLog;
use crate::result::{CriterionPass, CriterionResult, CriterionStatus, RunStatus, TokenUsage};
use crate::telemetry::Telemetry;

/// Collaborators shared by every flow of a run.
#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<RalphConfig>,
    pub agent: Arc<dyn Agent>,
    pub factory: Arc<dyn BackendFactory>,
    pub git: Arc<dyn GitWorkflow>,
    pub telemetry: Arc<dyn Telemetry>,
}

impl RunContext {
    fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            model: self.config.model.clone(),
            feedback_commands: self.config.feedback_commands.clone(),
            verify_timeout_ms: self.config.verify_timeout_ms,
            max_iterations_per_criterion: self.config.max_iterations_per_criterion,
        }
    }
}

/// What a scheduler hands back to the driver.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    /// Final pass flags in configuration order.
    pub passes: Vec<CriterionPass>,
    pub iterations: u32,
    pub usage: TokenUsage,
    pub criteria_results: Option<Vec<CriterionResult>>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
}

fn pass_flags(criteria: &[Criterion]) -> Vec<CriterionPass> {
    criteria
        .iter()
        .map(|c| CriterionPass {
            id: c.id.clone(),
            passes: c.passes(),
        })
        .collect()
}

/// Run every criterion in order against one backend.
pub async fn run_sequential(ctx: &RunContext, mut criteria: Vec<Criterion>) -> RunReport {
    let mut budget = ctx.config.run_budget();

    let body = match ctx.factory.create() {
        Ok(mut backend) => {
            let outcome = AssertUnwindSafe(sequential_body(
                ctx,
                backend.as_mut(),
                &mut criteria,
                &mut budget,
            ))
            .catch_unwind()
            .await;
            if let Err(err) = backend.cleanup().await {
                warn!(backend = %backend.id(), error = %err, "backend cleanup failed");
            }
            match outcome {
                Ok(result) => result,
                Err(panic) => Err(OrchestrationError::from_panic(panic)),
            }
        }
        Err(err) => Err(err.into()),
    };

    let (status, pr_url, error) = match body {
        Ok((status, pr_url)) => (status, pr_url, None),
        Err(err) => {
            obs::emit_flow_error("*", &err);
            (RunStatus::Error, None, Some(err.to_string()))
        }
    };

    RunReport {
        status,
        passes: pass_flags(&criteria),
        iterations: budget.iterations(),
        usage: budget.usage(),
        criteria_results: None,
        pr_url,
        error,
    }
}

async fn sequential_body(
    ctx: &RunContext,
    backend: &mut dyn ExecutionBackend,
    criteria: &mut [Criterion],
    budget: &mut RunBudget,
) -> Result<(RunStatus, Option<String>)> {
    backend.initialize().await?;
    let backend: &dyn ExecutionBackend = backend;
    let config = &ctx.config;

    let repo_git = config.repository.as_ref().zip(config.git.as_ref());
    let workdir = match repo_git {
        Some((repo, git)) => ctx.git.setup(backend, repo, git).await?,
        None => backend.workspace().to_string(),
    };

    let repository = config.repository.as_ref().map(|r| r.url.as_str());
    if let Err(err) = ProgressLog::new(backend, &workdir)
        .initialize(repository, criteria)
        .await
    {
        warn!(error = %err, "could not initialise progress log");
    }

    let settings = ctx.loop_settings();
    let machine = CriterionMachine::new(
        backend,
        ctx.agent.as_ref(),
        ctx.telemetry.as_ref(),
        &settings,
        &workdir,
    );

    for criterion in criteria.iter_mut() {
        if criterion.passes() {
            info!(criterion = %criterion.id, "already passing; skipped");
            continue;
        }
        if let Some(reason) = budget.stop_reason() {
            info!(?reason, "stopping before {}", criterion.id);
            return Ok((reason.into(), None));
        }

        let span = obs::criterion_span(&criterion.id);
        let run = machine.run(criterion, budget).instrument(span).await?;
        match run.outcome {
            MachineOutcome::Passed => {}
            MachineOutcome::Exhausted => {
                info!(criterion = %criterion.id, "iteration cap reached; moving on");
            }
            MachineOutcome::Stopped(reason) => return Ok((reason.into(), None)),
        }
    }

    if !criteria.iter().all(Criterion::passes) {
        return Ok((RunStatus::MaxIterations, None));
    }

    let mut pr_url = None;
    if let Some((repo, git)) = repo_git {
        let summary = criteria
            .iter()
            .map(|c| c.description.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        ctx.git.finalize(backend, &workdir, git, &summary).await?;
        pr_url = ctx.git.create_pull_request(repo, git, &summary).await?;
    }
    Ok((RunStatus::Success, pr_url))
}

/// Run each criterion in its own backend, at most `max_concurrent` at a time.
pub async fn run_parallel(ctx: &RunContext, criteria: Vec<Criterion>) -> RunReport {
    let cap = ctx.config.max_concurrent.max(1);
    let order: Vec<String> = criteria.iter().map(|c| c.id.clone()).collect();
    let mut results = Vec::with_capacity(criteria.len());
    let mut pending = VecDeque::new();
    for criterion in criteria {
        if criterion.passes() {
            results.push(CriterionResult::already_passed(&criterion.id));
        } else {
            pending.push_back(criterion);
        }
    }

    let mut running = JoinSet::new();
    loop {
        while running.len() < cap {
            let Some(criterion) = pending.pop_front() else {
                break;
            };
            let span = obs::criterion_span(&criterion.id);
            running.spawn(run_flow(ctx.clone(), criterion).instrument(span));
        }

        let Some(joined) = running.join_next().await else {
            break;
        };
        match joined {
            Ok(result) => {
                info!(criterion = %result.id, status = ?result.status, "flow finished");
                results.push(result);
            }
            Err(err) => warn!(error = %err, "flow task join error"),
        }
    }

    // A task that died outside its own panic guard left no result behind.
    for id in &order {
        if !results.iter().any(|r| &r.id == id) {
            obs::emit_flow_error(id, &"flow task ended without a result");
            results.push(CriterionResult::failed(id, "flow task ended without a result"));
        }
    }

    let passes = order
        .iter()
        .map(|id| CriterionPass {
            id: id.clone(),
            passes: results.iter().any(|r| &r.id == id && r.is_success()),
        })
        .collect();
    let mut usage = TokenUsage::default();
    for r in &results {
        usage.accumulate(&TokenUsage {
            input_tokens: r.tokens_used,
            output_tokens: 0,
            cost_usd: r.cost_usd,
        });
    }
    let status = if results.iter().all(CriterionResult::is_success) {
        RunStatus::Success
    } else {
        RunStatus::MaxIterations
    };

    RunReport {
        status,
        passes,
        iterations: results.iter().map(|r| r.iterations).sum(),
        usage,
        criteria_results: Some(results),
        pr_url: None,
        error: None,
    }
}

/// One isolated criterion flow: its own backend, branch and budget.
async fn run_flow(ctx: RunContext, mut criterion: Criterion) -> CriterionResult {
    let started = Instant::now();
    let id = criterion.id.clone();

    let outcome = match ctx.factory.create() {
        Ok(mut backend) => {
            let outcome = AssertUnwindSafe(flow_body(&ctx, backend.as_mut(), &mut criterion))
                .catch_unwind()
                .await;
            if let Err(err) = backend.cleanup().await {
                warn!(backend = %backend.id(), error = %err, "backend cleanup failed");
            }
            match outcome {
                Ok(result) => result,
                Err(panic) => Err(OrchestrationError::from_panic(panic)),
            }
        }
        Err(err) => Err(err.into()),
    };

    let mut result = outcome.unwrap_or_else(|err| {
        obs::emit_flow_error(&id, &err);
        CriterionResult::failed(&id, err.to_string())
    });
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}

async fn flow_body(
    ctx: &RunContext,
    backend: &mut dyn ExecutionBackend,
    criterion: &mut Criterion,
) -> Result<CriterionResult> {
    backend.initialize().await?;
    let backend: &dyn ExecutionBackend = backend;
    let config = &ctx.config;

    let git = match (&config.repository, &config.git) {
        (Some(repo), Some(git)) => Some((repo, git.for_criterion(criterion))),
        _ => None,
    };
    let workdir = match &git {
        Some((repo, git)) => ctx.git.setup(backend, repo, git).await?,
        None => backend.workspace().to_string(),
    };

    let repository = config.repository.as_ref().map(|r| r.url.as_str());
    if let Err(err) = ProgressLog::new(backend, &workdir)
        .initialize(repository, std::slice::from_ref(criterion))
        .await
    {
        warn!(error = %err, "could not initialise progress log");
    }

    let settings = ctx.loop_settings();
    let machine = CriterionMachine::new(
        backend,
        ctx.agent.as_ref(),
        ctx.telemetry.as_ref(),
        &settings,
        &workdir,
    );
    let mut budget = RunBudget::unlimited();
    let run = machine.run(criterion, &mut budget).await?;

    let mut pr_url = None;
    let status = match run.outcome {
        MachineOutcome::Passed => {
            if let Some((repo, git)) = &git {
                let summary = format!("{}: {}", criterion.id, criterion.description);
                ctx.git.finalize(backend, &workdir, git, &summary).await?;
                pr_url = ctx.git.create_pull_request(repo, git, &summary).await?;
            }
            CriterionStatus::Success
        }
        MachineOutcome::Exhausted | MachineOutcome::Stopped(_) => CriterionStatus::MaxIterations,
    };

    Ok(CriterionResult {
        id: criterion.id.clone(),
        status,
        iterations: run.iteration_count(),
        tokens_used: run.usage.total_tokens(),
        cost_usd: run.usage.cost_usd,
        duration_ms: run.duration.as_millis() as u64,
        pr_url,
        error: None,
    })
}
