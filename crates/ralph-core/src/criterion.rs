//! Acceptance criteria.

use serde::{Deserialize, Serialize};

/// One unit of required work, proven done by its backpressure command.
///
/// Everything except `passes` is fixed once loaded. `passes` only ever moves
/// from `false` to `true`, through [`Criterion::mark_passed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    /// Shell command whose zero exit code is the sole proof of completion.
    #[serde(alias = "check_command")]
    pub backpressure: String,
    #[serde(default)]
    passes: bool,
}

impl Criterion {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        backpressure: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            steps: Vec::new(),
            backpressure: backpressure.into(),
            passes: false,
        }
    }

    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn passes(&self) -> bool {
        self.passes
    }

    /// Record a successful verification. Returns `true` on the first call only.
    pub(crate) fn mark_passed(&mut self) -> bool {
        let first = !self.passes;
        self.passes = true;
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_flips_once_and_never_reverts() {
        let mut c = Criterion::new("c1", "do it", "true");
        assert!(!c.passes());
        assert!(c.mark_passed());
        assert!(!c.mark_passed());
        assert!(c.passes());
    }

    #[test]
    fn deserializes_with_defaults() {
        let c: Criterion = serde_json::from_str(
            r#"{"id": "api", "description": "Add endpoint", "backpressure": "cargo test"}"#,
        )
        .unwrap();
        assert!(c.steps.is_empty());
        assert!(!c.passes());

        let done: Criterion = serde_json::from_str(
            r#"{"id": "x", "description": "d", "backpressure": "true", "passes": true}"#,
        )
        .unwrap();
        assert!(done.passes());
    }
}
