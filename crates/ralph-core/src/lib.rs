//! Ralph Core
//!
//! Drives acceptance criteria through the generate/verify/retry loop.
//!
//! - [`criterion`], [`config`]: what a run is asked to do
//! - [`machine`]: the per-criterion state machine
//! - [`scheduler`]: sequential and bounded-parallel scheduling
//! - [`orchestrator`]: validation, collaborator wiring and aggregation
//! - [`agent`], [`git_workflow`], [`progress`], [`telemetry`]: collaborators

pub mod agent;
pub mod budget;
pub mod config;
pub mod criterion;
pub mod error;
pub mod git_workflow;
pub mod machine;
pub mod obs;
pub mod orchestrator;
pub mod progress;
pub mod prompt;
pub mod result;
pub mod scheduler;
pub mod telemetry;

pub use agent::{Agent, AgentRequest, AgentResponse, CommandAgent};
pub use budget::{RunBudget, StopReason};
pub use config::{
    BudgetConfig, ConfigError, ExecutionSection, GitConfig, RalphConfig, RepositoryConfig,
    RunMode, TaskCheck,
};
pub use criterion::Criterion;
pub use error::OrchestrationError;
pub use git_workflow::{GitError, GitWorkflow, StandardGitWorkflow};
pub use machine::{CriterionMachine, CriterionRun, LoopSettings, MachineOutcome, Phase};
pub use orchestrator::Orchestrator;
pub use result::{
    CriterionPass, CriterionResult, CriterionStatus, IterationOutcome, OrchestrationResult,
    RunStatus, TokenUsage,
};
pub use scheduler::{run_parallel, run_sequential, RunContext, RunReport};
pub use telemetry::{init_tracing, NoopTelemetry, Telemetry, TracingTelemetry};

pub use ralph_runtime::{
    BackendFactory, Credentials, DefaultBackendFactory, ExecuteOptions, ExecuteResult,
    ExecutionBackend, RuntimeConfig, RuntimeKind,
};
