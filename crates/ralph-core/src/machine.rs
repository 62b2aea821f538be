//! The per-criterion generate/verify/retry state machine.
//!
//! ```text
//! Pending -> Generating -> Verifying -> Passed
//!                ^             |
//!                |             v
//!                +-------- Retrying -> Exhausted
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use ralph_runtime::{BackendError, ExecuteOptions, ExecutionBackend, METRICS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentRequest};
use crate::budget::{RunBudget, StopReason};
use crate::criterion::Criterion;
use crate::progress::{format_entry, ProgressLog};
use crate::prompt::{build_prompt, failure_context, head_chars, FAILURE_EXCERPT_CHARS};
use crate::result::{IterationOutcome, TokenUsage};
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Generating,
    Verifying,
    Passed,
    Retrying,
    Exhausted,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Generating => "generating",
            Phase::Verifying => "verifying",
            Phase::Passed => "passed",
            Phase::Retrying => "retrying",
            Phase::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Passed | Phase::Exhausted)
    }

    /// Edges of the iteration graph. `Pending -> Exhausted` covers a
    /// criterion whose cap is already spent.
    pub fn can_transition_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Pending, Phase::Generating)
                | (Phase::Pending, Phase::Exhausted)
                | (Phase::Generating, Phase::Verifying)
                | (Phase::Verifying, Phase::Passed)
                | (Phase::Verifying, Phase::Retrying)
                | (Phase::Retrying, Phase::Generating)
                | (Phase::Retrying, Phase::Exhausted)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a criterion's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOutcome {
    Passed,
    /// Per-criterion iteration cap hit without passing.
    Exhausted,
    /// The shared run budget ran out before the criterion passed.
    Stopped(StopReason),
}

/// Everything one criterion's loop produced.
#[derive(Debug, Clone)]
pub struct CriterionRun {
    pub outcome: MachineOutcome,
    pub iterations: Vec<IterationOutcome>,
    pub usage: TokenUsage,
    pub duration: Duration,
}

impl CriterionRun {
    pub fn iteration_count(&self) -> u32 {
        self.iterations.len() as u32
    }
}

/// Loop parameters shared by every criterion of a run.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub model: String,
    pub feedback_commands: Vec<String>,
    pub verify_timeout_ms: u64,
    pub max_iterations_per_criterion: u32,
}

pub struct CriterionMachine<'a> {
    backend: &'a dyn ExecutionBackend,
    agent: &'a dyn Agent,
    telemetry: &'a dyn Telemetry,
    settings: &'a LoopSettings,
    workdir: &'a str,
}

impl<'a> CriterionMachine<'a> {
    pub fn new(
        backend: &'a dyn ExecutionBackend,
        agent: &'a dyn Agent,
        telemetry: &'a dyn Telemetry,
        settings: &'a LoopSettings,
        workdir: &'a str,
    ) -> Self {
        Self {
            backend,
            agent,
            telemetry,
            settings,
            workdir,
        }
    }

    /// Drive `criterion` until it passes, exhausts its cap, or `budget` runs
    /// out. Only backend failures during verification are errors.
    pub async fn run(
        &self,
        criterion: &mut Criterion,
        budget: &mut RunBudget,
    ) -> Result<CriterionRun, BackendError> {
        let started = Instant::now();
        let progress = ProgressLog::new(self.backend, self.workdir);
        let mut phase = Phase::Pending;
        let mut failure: Option<String> = None;
        let mut iterations = Vec::new();
        let mut usage = TokenUsage::default();

        let outcome = loop {
            let iteration = iterations.len() as u32 + 1;
            if iteration > self.settings.max_iterations_per_criterion {
                self.transition(&criterion.id, &mut phase, Phase::Exhausted);
                break MachineOutcome::Exhausted;
            }

            self.transition(&criterion.id, &mut phase, Phase::Generating);
            let log = match progress.read().await {
                Ok(text) => text,
                Err(err) => {
                    warn!(criterion = %criterion.id, error = %err, "could not read progress log");
                    String::new()
                }
            };
            let request = AgentRequest {
                task: build_prompt(
                    criterion,
                    &self.settings.feedback_commands,
                    failure.as_deref(),
                    &log,
                ),
                workdir: self.workdir.to_string(),
                failure_context: failure.clone(),
                model: self.settings.model.clone(),
            };
            let (agent_output, iteration_usage, agent_error) =
                match self.agent.run(self.backend, &request).await {
                    Ok(resp) => (resp.output, resp.usage, None),
                    Err(err) => {
                        warn!(criterion = %criterion.id, iteration, error = %err, "agent invocation failed");
                        (String::new(), TokenUsage::default(), Some(err.to_string()))
                    }
                };
            usage.accumulate(&iteration_usage);
            budget.record_iteration(&iteration_usage);
            METRICS.inc_iterations();

            self.transition(&criterion.id, &mut phase, Phase::Verifying);
            let verify = self
                .backend
                .execute(
                    &criterion.backpressure,
                    &ExecuteOptions::in_dir(self.workdir)
                        .with_timeout_ms(self.settings.verify_timeout_ms),
                )
                .await?;
            let passed = verify.success();
            METRICS.record_verification(passed);
            debug!(
                criterion = %criterion.id,
                iteration,
                exit_code = verify.exit_code,
                "verification finished"
            );

            let entry = format_entry(iteration, &criterion.id, passed, &agent_output, Utc::now());
            if let Err(err) = progress.append(&entry).await {
                warn!(criterion = %criterion.id, error = %err, "could not append progress entry");
            }

            let record = IterationOutcome {
                criterion_id: criterion.id.clone(),
                iteration,
                agent_output,
                usage: iteration_usage,
                verification_exit_code: verify.exit_code,
                passed,
                agent_error,
            };
            self.telemetry.iteration_finished(&record);
            let agent_error = record.agent_error.clone();
            iterations.push(record);

            if passed {
                self.transition(&criterion.id, &mut phase, Phase::Passed);
                criterion.mark_passed();
                info!(criterion = %criterion.id, iteration, "criterion passed");
                break MachineOutcome::Passed;
            }

            self.transition(&criterion.id, &mut phase, Phase::Retrying);
            let verify_failure = failure_context(&criterion.backpressure, &verify.stdout, &verify.stderr);
            failure = Some(match agent_error {
                Some(err) => format!(
                    "Agent invocation failed: {}\n{verify_failure}",
                    head_chars(&err, FAILURE_EXCERPT_CHARS)
                ),
                None => verify_failure,
            });

            if let Some(reason) = budget.stop_reason() {
                info!(criterion = %criterion.id, iteration, ?reason, "run budget spent");
                break MachineOutcome::Stopped(reason);
            }
        };

        Ok(CriterionRun {
            outcome,
            iterations,
            usage,
            duration: started.elapsed(),
        })
    }

    fn transition(&self, criterion_id: &str, phase: &mut Phase, next: Phase) {
        debug_assert!(
            phase.can_transition_to(next),
            "illegal transition {phase} -> {next}"
        );
        debug!(criterion = %criterion_id, from = %phase, to = %next, "phase");
        *phase = next;
        self.telemetry.phase_changed(criterion_id, next);
    }
}
