//! Tracing initialisation and the run telemetry hook.
//!
//! Call [`init_tracing`] once at program start. Repeated calls are ignored
//! since the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::machine::Phase;
use crate::obs;
use crate::result::{IterationOutcome, OrchestrationResult};

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
///
/// Logs go to stderr; stdout is reserved for command output.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

/// Observer of run progress. Hooks are called from scheduler tasks and must
/// not block.
pub trait Telemetry: Send + Sync {
    fn run_started(&self, _run_id: &str, _mode: &str, _criteria: usize) {}

    fn phase_changed(&self, _criterion_id: &str, _phase: Phase) {}

    fn iteration_finished(&self, _outcome: &IterationOutcome) {}

    fn run_finished(&self, _result: &OrchestrationResult) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}

/// Forwards hooks to structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn run_started(&self, run_id: &str, mode: &str, criteria: usize) {
        obs::emit_run_started(run_id, mode, criteria);
    }

    fn phase_changed(&self, criterion_id: &str, phase: Phase) {
        obs::emit_phase_changed(criterion_id, phase.as_str());
    }

    fn iteration_finished(&self, outcome: &IterationOutcome) {
        obs::emit_iteration_finished(
            &outcome.criterion_id,
            outcome.iteration,
            outcome.passed,
            outcome.usage.total_tokens(),
        );
    }

    fn run_finished(&self, result: &OrchestrationResult) {
        obs::emit_run_finished(
            &result.run_id,
            &result.status.to_string(),
            result.total_iterations,
            result.duration_ms,
        );
    }
}
