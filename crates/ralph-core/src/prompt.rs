//! Task prompt construction for one `Generating` step.

use crate::criterion::Criterion;

/// Characters of the progress log carried into each prompt.
pub const PROGRESS_TAIL_CHARS: usize = 2_000;
/// Characters of verification output carried into the failure context.
pub const FAILURE_EXCERPT_CHARS: usize = 1_000;

/// Build the prompt handed to the agent.
pub fn build_prompt(
    criterion: &Criterion,
    feedback_commands: &[String],
    failure_context: Option<&str>,
    progress: &str,
) -> String {
    let mut prompt = format!("# Task: {}\n\n", criterion.description);

    if !criterion.steps.is_empty() {
        prompt.push_str("## Steps\n");
        for (i, step) in criterion.steps.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, step));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "## Backpressure Check\nThis task is complete only when the following command exits 0:\n```\n{}\n```\n\n",
        criterion.backpressure
    ));

    if !feedback_commands.is_empty() {
        prompt.push_str("## Feedback Commands to Run\n");
        for cmd in feedback_commands {
            prompt.push_str(&format!("- `{cmd}`\n"));
        }
        prompt.push('\n');
    }

    if let Some(failure) = failure_context {
        prompt.push_str(&format!(
            "## Previous Attempt Failed\n{failure}\n\nFix this issue in this iteration.\n\n"
        ));
    }

    let tail = tail_chars(progress, PROGRESS_TAIL_CHARS);
    if !tail.trim().is_empty() {
        prompt.push_str(&format!("## Progress So Far\n```\n{tail}\n```\n\n"));
    }

    prompt.push_str(
        "When you finish, summarize what you did inside a ```progress fenced block.\n\
         Remember: explore first, then execute, then verify with the feedback loops.\n",
    );
    prompt
}

/// Failure context for the next iteration after a failed verification.
pub fn failure_context(command: &str, stdout: &str, stderr: &str) -> String {
    let output = if stdout.trim().is_empty() { stderr } else { stdout };
    format!(
        "Backpressure command failed: {command}\nOutput: {}",
        head_chars(output, FAILURE_EXCERPT_CHARS)
    )
}

/// The last `max` characters of `text`, on a char boundary.
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[start..]
}

/// The first `max` characters of `text`, on a char boundary.
pub fn head_chars(text: &str, max: usize) -> &str {
    let end = text
        .char_indices()
        .nth(max)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criterion() -> Criterion {
        Criterion::new("login", "Add a login endpoint", "cargo test login")
            .with_steps(["Write the handler", "Add a test"])
    }

    #[test]
    fn first_iteration_prompt() {
        let p = build_prompt(&criterion(), &["cargo clippy".to_string()], None, "");
        assert!(p.starts_with("# Task: Add a login endpoint\n"));
        assert!(p.contains("1. Write the handler\n2. Add a test\n"));
        assert!(p.contains("```\ncargo test login\n```"));
        assert!(p.contains("- `cargo clippy`"));
        assert!(!p.contains("Previous Attempt Failed"));
        assert!(!p.contains("Progress So Far"));
    }

    #[test]
    fn retry_prompt_carries_failure_and_progress_tail() {
        let progress = format!("{}END", "x".repeat(5_000));
        let failure = failure_context("cargo test login", "1 test failed", "");
        let p = build_prompt(&criterion(), &[], Some(&failure), &progress);
        assert!(p.contains("## Previous Attempt Failed\nBackpressure command failed: cargo test login\nOutput: 1 test failed"));
        assert!(p.contains("Fix this issue in this iteration."));
        assert!(p.contains("END\n```"));
        assert!(!p.contains(&"x".repeat(2_001)));
    }

    #[test]
    fn failure_context_falls_back_to_stderr_and_truncates() {
        let ctx = failure_context("make", "", &"e".repeat(3_000));
        assert_eq!(ctx.len(), "Backpressure command failed: make\nOutput: ".len() + 1_000);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo wörld";
        assert_eq!(tail_chars(text, 5), "wörld");
        assert_eq!(head_chars(text, 2), "hé");
        assert_eq!(tail_chars("ab", 10), "ab");
    }
}
