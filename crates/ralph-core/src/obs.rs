//! Structured lifecycle events for runs and criteria.
//!
//! Every event carries an `event` field (`run.started`, `criterion.phase`,
//! `iteration.finished`, `run.finished`, `flow.error`) so log pipelines can
//! filter on it.

use tracing::{info, warn, Span};

/// Span covering a whole run.
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("ralph.run", run_id = %run_id)
}

/// Span covering one criterion's flow.
pub fn criterion_span(criterion_id: &str) -> Span {
    tracing::info_span!("ralph.criterion", criterion_id = %criterion_id)
}

pub fn emit_run_started(run_id: &str, mode: &str, criteria: usize) {
    info!(event = "run.started", run_id = %run_id, mode = %mode, criteria);
}

pub fn emit_phase_changed(criterion_id: &str, phase: &str) {
    info!(event = "criterion.phase", criterion_id = %criterion_id, phase = %phase);
}

pub fn emit_iteration_finished(criterion_id: &str, iteration: u32, passed: bool, tokens: u64) {
    info!(
        event = "iteration.finished",
        criterion_id = %criterion_id,
        iteration,
        passed,
        tokens,
    );
}

pub fn emit_run_finished(run_id: &str, status: &str, iterations: u32, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        iterations,
        duration_ms,
    );
}

/// A flow or run failed; logged at warn level.
pub fn emit_flow_error(criterion_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "flow.error", criterion_id = %criterion_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_and_events_do_not_panic_without_subscriber() {
        let span = run_span("run-1");
        let _guard = span.enter();
        emit_run_started("run-1", "sequential", 2);
        emit_phase_changed("c1", "generating");
        emit_flow_error("c1", &"boom");
    }
}
