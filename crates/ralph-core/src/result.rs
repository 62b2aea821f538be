//! Iteration, criterion and run outcomes.

use serde::{Deserialize, Serialize};

/// Token counters reported by the agent for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, alias = "total_cost_usd")]
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cost_usd += other.cost_usd;
    }
}

/// What happened in one generate/verify cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationOutcome {
    pub criterion_id: String,
    pub iteration: u32,
    pub agent_output: String,
    pub usage: TokenUsage,
    pub verification_exit_code: i32,
    pub passed: bool,
    /// Set when the agent invocation itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    Success,
    MaxIterations,
    Error,
}

/// Final record for one criterion. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub id: String,
    pub status: CriterionStatus,
    pub iterations: u32,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CriterionResult {
    /// Result for a criterion that was already marked as passing.
    pub fn already_passed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: CriterionStatus::Success,
            iterations: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            pr_url: None,
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: CriterionStatus::Error,
            error: Some(error.into()),
            ..Self::already_passed(id)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CriterionStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    MaxIterations,
    BudgetExhausted,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Success => "success",
            RunStatus::MaxIterations => "max_iterations",
            RunStatus::BudgetExhausted => "budget_exhausted",
            RunStatus::Error => "error",
        })
    }
}

/// Pass flag of one criterion at the end of a run, in configuration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionPass {
    pub id: String,
    pub passes: bool,
}

/// Aggregate outcome of a whole run. Always one of the four statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub run_id: String,
    pub status: RunStatus,
    pub total_iterations: u32,
    pub passes: Vec<CriterionPass>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    /// Per-criterion results in completion order (parallel mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria_results: Option<Vec<CriterionResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrchestrationResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn all_passed(&self) -> bool {
        self.passes.iter().all(|p| p.passes)
    }
}
