//! Token, cost and iteration budget for a run.

use crate::result::{RunStatus, TokenUsage};

/// Why a run stopped before every criterion passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BudgetExhausted,
    IterationCapReached,
}

impl From<StopReason> for RunStatus {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::BudgetExhausted => RunStatus::BudgetExhausted,
            StopReason::IterationCapReached => RunStatus::MaxIterations,
        }
    }
}

/// Running totals checked after every iteration.
#[derive(Debug, Clone, Default)]
pub struct RunBudget {
    max_tokens: Option<u64>,
    max_cost_usd: Option<f64>,
    max_iterations: Option<u32>,
    used: TokenUsage,
    iterations: u32,
}

impl RunBudget {
    pub fn new(max_tokens: Option<u64>, max_cost_usd: Option<f64>, max_iterations: Option<u32>) -> Self {
        Self {
            max_tokens,
            max_cost_usd,
            max_iterations,
            ..Default::default()
        }
    }

    /// Tracks totals without ever stopping the run.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn record_iteration(&mut self, usage: &TokenUsage) {
        self.used.accumulate(usage);
        self.iterations += 1;
    }

    /// Token/cost exhaustion wins over the iteration cap.
    pub fn stop_reason(&self) -> Option<StopReason> {
        let tokens_out = self
            .max_tokens
            .is_some_and(|max| self.used.total_tokens() >= max);
        let cost_out = self
            .max_cost_usd
            .is_some_and(|max| self.used.cost_usd >= max);
        if tokens_out || cost_out {
            return Some(StopReason::BudgetExhausted);
        }
        if self.max_iterations.is_some_and(|max| self.iterations >= max) {
            return Some(StopReason::IterationCapReached);
        }
        None
    }

    pub fn usage(&self) -> TokenUsage {
        self.used
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}
