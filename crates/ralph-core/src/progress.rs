//! Append-only, human-readable progress log kept in the backend workspace.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use ralph_runtime::backend::resolve_path;
use ralph_runtime::{BackendError, ExecutionBackend};
use regex::Regex;

use crate::criterion::Criterion;

pub const PROGRESS_FILE: &str = "progress.txt";

/// Progress log of one working directory inside a backend.
pub struct ProgressLog<'a> {
    backend: &'a dyn ExecutionBackend,
    path: String,
}

impl<'a> ProgressLog<'a> {
    pub fn new(backend: &'a dyn ExecutionBackend, workdir: &str) -> Self {
        Self {
            backend,
            path: resolve_path(workdir, PROGRESS_FILE),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Write the header unless a log already exists.
    pub async fn initialize(
        &self,
        repository: Option<&str>,
        criteria: &[Criterion],
    ) -> Result<(), BackendError> {
        if self.backend.file_exists(&self.path).await? {
            return Ok(());
        }
        let header = format_header(Utc::now(), repository, criteria);
        self.backend.write_file(&self.path, header.as_bytes()).await
    }

    /// Whole log text; empty when the log does not exist yet.
    pub async fn read(&self) -> Result<String, BackendError> {
        match self.backend.read_file(&self.path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) if err.is_not_found() => Ok(String::new()),
            Err(err) => Err(err),
        }
    }

    pub async fn append(&self, entry: &str) -> Result<(), BackendError> {
        let mut text = self.read().await?;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(entry);
        self.backend.write_file(&self.path, text.as_bytes()).await
    }
}

pub fn format_header(
    started: DateTime<Utc>,
    repository: Option<&str>,
    criteria: &[Criterion],
) -> String {
    let mut header = format!(
        "# Ralph Progress Log\n# Started: {}\n# Repository: {}\n\n## Criteria\n",
        started.to_rfc3339(),
        repository.unwrap_or("(none)")
    );
    for c in criteria {
        let mark = if c.passes() { "x" } else { " " };
        header.push_str(&format!("- [{mark}] {}: {}\n", c.id, c.description));
    }
    header.push_str("\n---\n\n");
    header
}

pub fn format_entry(
    iteration: u32,
    criterion_id: &str,
    passed: bool,
    agent_output: &str,
    at: DateTime<Utc>,
) -> String {
    let block = extract_progress_block(agent_output)
        .map(|b| format!("```progress\n{b}\n```"))
        .unwrap_or_else(|| "No progress block found".to_string());
    format!(
        "## Iteration {iteration} - {criterion_id} ({})\nTime: {}\n\n{block}\n\n---\n\n",
        if passed { "PASS" } else { "FAIL" },
        at.to_rfc3339()
    )
}

/// Contents of the agent's last ```` ```progress ```` fenced block.
pub fn extract_progress_block(output: &str) -> Option<&str> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?s)```progress[ \t]*\r?\n(.*?)\r?\n?```").ok())
        .as_ref()?;
    re.captures_iter(output)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ralph_runtime::{LocalBackend, LocalOptions};

    #[test]
    fn entry_includes_progress_block() {
        let out = "did things\n```progress\nAdded handler\nTests pass\n```\nbye";
        let at = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let entry = format_entry(2, "login", true, out, at);
        assert!(entry.starts_with("## Iteration 2 - login (PASS)\nTime: 2026-01-02T03:04:05+00:00\n"));
        assert!(entry.contains("```progress\nAdded handler\nTests pass\n```"));
        assert!(entry.ends_with("---\n\n"));
    }

    #[test]
    fn missing_block_is_noted() {
        let entry = format_entry(1, "c", false, "no fences here", Utc::now());
        assert!(entry.contains("(FAIL)"));
        assert!(entry.contains("No progress block found"));
    }

    #[test]
    fn header_lists_criteria() {
        let criteria = vec![Criterion::new("a", "First", "true")];
        let header = format_header(Utc::now(), Some("https://github.com/acme/app"), &criteria);
        assert!(header.starts_with("# Ralph Progress Log\n"));
        assert!(header.contains("# Repository: https://github.com/acme/app"));
        assert!(header.contains("- [ ] a: First"));
    }

    #[tokio::test]
    async fn log_round_trips_through_backend() {
        let mut backend = LocalBackend::new(LocalOptions::default());
        backend.initialize().await.unwrap();
        let workdir = backend.workspace().to_string();
        let log = ProgressLog::new(&backend, &workdir);

        assert_eq!(log.read().await.unwrap(), "");
        log.initialize(None, &[Criterion::new("a", "First", "true")])
            .await
            .unwrap();
        log.append("## Iteration 1 - a (FAIL)\n").await.unwrap();
        log.initialize(None, &[]).await.unwrap();

        let text = log.read().await.unwrap();
        assert!(text.starts_with("# Ralph Progress Log"));
        assert!(text.ends_with("## Iteration 1 - a (FAIL)\n"));

        backend.cleanup().await.unwrap();
    }
}
