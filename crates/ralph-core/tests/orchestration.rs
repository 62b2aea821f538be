//! End-to-end orchestration properties over real local backends with stub
//! agents.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ralph_core::{
    Agent, AgentRequest, AgentResponse, Criterion, CriterionStatus, Orchestrator, RalphConfig,
    RunMode, RunStatus, TokenUsage,
};
use ralph_runtime::{
    BackendError, BackendFactory, BackendKind, Credentials, ExecuteOptions, ExecuteResult,
    ExecutionBackend, LifecycleState, LocalBackend, LocalOptions,
};

// ---------------------------------------------------------------------------
// Backend and factory that count lifecycle calls
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    initialized: AtomicUsize,
    cleaned: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

struct CountingBackend {
    inner: LocalBackend,
    counters: Arc<Counters>,
    fail_execute: bool,
}

#[async_trait]
impl ExecutionBackend for CountingBackend {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn workspace(&self) -> &str {
        self.inner.workspace()
    }

    fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    async fn initialize(&mut self) -> ralph_runtime::Result<()> {
        self.counters.initialized.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        self.inner.initialize().await
    }

    async fn cleanup(&mut self) -> ralph_runtime::Result<()> {
        self.counters.cleaned.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        self.inner.cleanup().await
    }

    async fn execute(
        &self,
        command: &str,
        options: &ExecuteOptions,
    ) -> ralph_runtime::Result<ExecuteResult> {
        if self.fail_execute {
            return Err(BackendError::Transport("sandbox went away".to_string()));
        }
        self.inner.execute(command, options).await
    }

    async fn execute_argv(
        &self,
        argv: &[String],
        options: &ExecuteOptions,
    ) -> ralph_runtime::Result<ExecuteResult> {
        self.inner.execute_argv(argv, options).await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> ralph_runtime::Result<()> {
        self.inner.write_file(path, contents).await
    }

    async fn read_file(&self, path: &str) -> ralph_runtime::Result<Vec<u8>> {
        self.inner.read_file(path).await
    }

    async fn file_exists(&self, path: &str) -> ralph_runtime::Result<bool> {
        self.inner.file_exists(path).await
    }
}

#[derive(Default)]
struct CountingFactory {
    counters: Arc<Counters>,
    fail_execute: bool,
}

impl BackendFactory for CountingFactory {
    fn create(&self) -> ralph_runtime::Result<Box<dyn ExecutionBackend>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingBackend {
            inner: LocalBackend::new(LocalOptions::default()),
            counters: Arc::clone(&self.counters),
            fail_execute: self.fail_execute,
        }))
    }
}

// ---------------------------------------------------------------------------
// Stub agents
// ---------------------------------------------------------------------------

/// Runs `script` in the working directory and reports fixed usage. Tracks
/// how many invocations overlap.
struct ScriptAgent {
    script: String,
    tokens: u64,
    hold: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptAgent {
    fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
            tokens: 10,
            hold: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    fn holding(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }
}

#[async_trait]
impl Agent for ScriptAgent {
    async fn run(
        &self,
        backend: &dyn ExecutionBackend,
        request: &AgentRequest,
    ) -> Result<AgentResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(self.hold).await;
        let out = backend
            .execute(&self.script, &ExecuteOptions::in_dir(&request.workdir))
            .await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        out?;
        Ok(AgentResponse {
            output: "```progress\nworked\n```".to_string(),
            usage: TokenUsage {
                input_tokens: self.tokens,
                output_tokens: 0,
                cost_usd: 0.0,
            },
        })
    }
}

struct PanickingAgent;

#[async_trait]
impl Agent for PanickingAgent {
    async fn run(
        &self,
        _backend: &dyn ExecutionBackend,
        _request: &AgentRequest,
    ) -> Result<AgentResponse, BackendError> {
        panic!("agent exploded");
    }
}

fn orchestrator(
    config: RalphConfig,
    agent: Arc<dyn Agent>,
    factory: Arc<CountingFactory>,
) -> Orchestrator {
    Orchestrator::new(config, Credentials::default())
        .with_agent(agent)
        .with_backend_factory(factory)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_criterion_passes_on_first_iteration() {
    let config = RalphConfig::default().with_criteria(vec![Criterion::new(
        "done",
        "Create done.txt",
        "test -f done.txt",
    )]);
    let agent = Arc::new(ScriptAgent::new("touch done.txt"));
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, agent.clone(), factory.clone()).run().await;

    assert_eq!(result.status, RunStatus::Success, "{result:?}");
    assert_eq!(result.total_iterations, 1);
    assert!(result.all_passed());
    assert_eq!(result.tokens_used, 10);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), 1);
    assert_eq!(factory.counters.cleaned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_backpressure_exhausts_the_cap() {
    let mut config = RalphConfig::default()
        .with_criteria(vec![Criterion::new("never", "Impossible", "false")]);
    config.max_iterations_per_criterion = 3;
    let agent = Arc::new(ScriptAgent::new("true"));
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, agent.clone(), factory).run().await;

    assert_eq!(result.status, RunStatus::MaxIterations);
    assert_eq!(result.total_iterations, 3);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    assert!(!result.all_passed());
}

#[tokio::test]
async fn token_budget_stops_after_first_iteration() {
    let mut config = RalphConfig::default()
        .with_criteria(vec![Criterion::new("never", "Impossible", "false")]);
    config.budget.max_tokens = 500;
    let agent = Arc::new(ScriptAgent::new("true").with_tokens(1_000));
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, agent.clone(), factory).run().await;

    assert_eq!(result.status, RunStatus::BudgetExhausted);
    assert_eq!(result.total_iterations, 1);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sequential_exhausted_criterion_does_not_block_the_next() {
    let mut config = RalphConfig::default().with_criteria(vec![
        Criterion::new("a", "Impossible", "false"),
        Criterion::new("b", "Create done.txt", "test -f done.txt"),
    ]);
    config.max_iterations_per_criterion = 2;
    let agent = Arc::new(ScriptAgent::new("touch done.txt"));
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, agent, factory.clone()).run().await;

    assert_eq!(result.status, RunStatus::MaxIterations);
    assert_eq!(result.total_iterations, 3);
    assert!(!result.passes[0].passes);
    assert!(result.passes[1].passes);
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cleanup_runs_when_execute_errors() {
    let config = RalphConfig::default()
        .with_criteria(vec![Criterion::new("c", "anything", "true")]);
    let agent = Arc::new(ScriptAgent::new("true"));
    let factory = Arc::new(CountingFactory {
        fail_execute: true,
        ..Default::default()
    });

    let result = orchestrator(config, agent, factory.clone()).run().await;

    assert_eq!(result.status, RunStatus::Error);
    assert!(result.error.as_deref().unwrap_or_default().contains("sandbox went away"));
    assert_eq!(factory.counters.initialized.load(Ordering::SeqCst), 1);
    assert_eq!(factory.counters.cleaned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parallel_respects_concurrency_cap() {
    let criteria = (0..5)
        .map(|i| Criterion::new(format!("c{i}"), format!("criterion {i}"), "test -f done.txt"))
        .collect();
    let mut config = RalphConfig::default()
        .with_criteria(criteria)
        .with_mode(RunMode::Parallel);
    config.max_concurrent = 2;
    let agent = Arc::new(ScriptAgent::new("touch done.txt").holding(Duration::from_millis(50)));
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, agent, factory.clone()).run().await;

    assert_eq!(result.status, RunStatus::Success, "{result:?}");
    let results = result.criteria_results.as_ref().unwrap();
    assert_eq!(results.len(), 5);
    let mut ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, ["c0", "c1", "c2", "c3", "c4"]);
    assert!(factory.counters.max_live.load(Ordering::SeqCst) <= 2);
    assert_eq!(factory.counters.initialized.load(Ordering::SeqCst), 5);
    assert_eq!(factory.counters.cleaned.load(Ordering::SeqCst), 5);
    assert_eq!(result.total_iterations, 5);
}

#[tokio::test]
async fn parallel_with_cap_one_never_overlaps_generation() {
    let config = RalphConfig {
        max_concurrent: 1,
        ..RalphConfig::default()
    }
    .with_criteria(vec![
        Criterion::new("a", "first", "test -f done.txt"),
        Criterion::new("b", "second", "test -f done.txt"),
    ])
    .with_mode(RunMode::Parallel);
    let agent = Arc::new(ScriptAgent::new("touch done.txt").holding(Duration::from_millis(30)));
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, agent.clone(), factory).run().await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.criteria_results.as_ref().unwrap().len(), 2);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    assert_eq!(agent.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parallel_flow_panic_becomes_error_result() {
    let config = RalphConfig::default()
        .with_criteria(vec![Criterion::new("boom", "explodes", "true")])
        .with_mode(RunMode::Parallel);
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, Arc::new(PanickingAgent), factory.clone())
        .run()
        .await;

    assert_eq!(result.status, RunStatus::MaxIterations);
    let r = &result.criteria_results.as_ref().unwrap()[0];
    assert_eq!(r.status, CriterionStatus::Error);
    assert!(r.error.as_deref().unwrap_or_default().contains("agent exploded"));
    assert_eq!(factory.counters.initialized.load(Ordering::SeqCst), 1);
    assert_eq!(factory.counters.cleaned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn already_passing_criteria_are_not_rerun() {
    let config = RalphConfig::from_json(
        r#"{
            "mode": "parallel",
            "criteria": [
                {"id": "old", "description": "done before", "backpressure": "false", "passes": true},
                {"id": "new", "description": "create file", "backpressure": "test -f done.txt"}
            ]
        }"#,
    )
    .unwrap();
    let agent = Arc::new(ScriptAgent::new("touch done.txt"));
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, agent.clone(), factory.clone()).run().await;

    assert_eq!(result.status, RunStatus::Success);
    assert!(result.all_passed());
    let old = result
        .criteria_results
        .as_ref()
        .unwrap()
        .iter()
        .find(|r| r.id == "old")
        .unwrap();
    assert_eq!(old.iterations, 0);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_config_creates_no_backend() {
    let config = RalphConfig::default();
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, Arc::new(ScriptAgent::new("true")), factory.clone())
        .run()
        .await;

    assert_eq!(result.status, RunStatus::Error);
    assert!(result.error.unwrap().contains("at least one criterion"));
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn passes_flag_only_moves_forward() {
    let mut config = RalphConfig::default().with_criteria(vec![Criterion::new(
        "flip",
        "passes then breaks",
        "test -f done.txt",
    )]);
    config.max_iterations_per_criterion = 3;
    let agent = Arc::new(ScriptAgent::new("touch done.txt"));
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, agent.clone(), factory).run().await;

    assert!(result.passes[0].passes);
    assert_eq!(result.total_iterations, 1);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
}

/// Fails its first `fail_first` invocations, then runs `script`. Keeps the
/// prompt and failure context of every call.
struct RecordingAgent {
    script: String,
    fail_first: usize,
    seen: std::sync::Mutex<Vec<AgentRequest>>,
}

impl RecordingAgent {
    fn new(script: &str, fail_first: usize) -> Self {
        Self {
            script: script.to_string(),
            fail_first,
            seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<AgentRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for RecordingAgent {
    async fn run(
        &self,
        backend: &dyn ExecutionBackend,
        request: &AgentRequest,
    ) -> Result<AgentResponse, BackendError> {
        let call = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(request.clone());
            seen.len()
        };
        if call <= self.fail_first {
            return Err(BackendError::Transport("model endpoint unreachable".to_string()));
        }
        backend
            .execute(&self.script, &ExecuteOptions::in_dir(&request.workdir))
            .await?;
        Ok(AgentResponse {
            output: "```progress\nretried\n```".to_string(),
            usage: TokenUsage::default(),
        })
    }
}

#[tokio::test]
async fn agent_error_feeds_the_next_attempt_and_the_loop_continues() {
    let config = RalphConfig::default().with_criteria(vec![Criterion::new(
        "done",
        "Create done.txt",
        "test -f done.txt",
    )]);
    let agent = Arc::new(RecordingAgent::new("touch done.txt", 1));
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, agent.clone(), factory).run().await;

    assert_eq!(result.status, RunStatus::Success, "{result:?}");
    assert_eq!(result.total_iterations, 2);

    let requests = agent.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].failure_context, None);
    let context = requests[1].failure_context.as_deref().unwrap();
    assert!(context.starts_with("Agent invocation failed: "), "{context}");
    assert!(context.contains("model endpoint unreachable"), "{context}");
    assert!(context.contains("Backpressure command failed: test -f done.txt"), "{context}");
    assert!(requests[1].task.contains("## Previous Attempt Failed"));
    assert!(requests[1].task.contains("model endpoint unreachable"));
}

#[tokio::test]
async fn verify_output_reaches_the_next_prompt() {
    // Silent stdout, so the excerpt falls back to stderr and is cut at 1000 chars.
    let noisy = "head -c 3000 /dev/zero | tr '\\0' e >&2; test -f done.txt";
    let config = RalphConfig::default()
        .with_criteria(vec![Criterion::new("noisy", "Quiet the check", noisy)]);
    // The file only appears on the second attempt.
    let second_time_lucky = "[ -f .seen ] && touch done.txt; touch .seen";
    let agent = Arc::new(RecordingAgent::new(second_time_lucky, 0));
    let factory = Arc::new(CountingFactory::default());

    let result = orchestrator(config, agent.clone(), factory.clone()).run().await;
    assert_eq!(result.status, RunStatus::Success, "{result:?}");
    assert_eq!(result.total_iterations, 2);

    let requests = agent.requests();
    let context = requests[1].failure_context.as_deref().unwrap();
    let excerpt = context.split("Output: ").nth(1).unwrap();
    assert_eq!(excerpt, "e".repeat(1_000));
    assert!(requests[1].task.contains(&"e".repeat(1_000)));
    assert!(!requests[1].task.contains(&"e".repeat(1_001)));

    // With something on stdout, stdout wins over stderr.
    let both = "echo from-stdout; echo from-stderr >&2; test -f done.txt";
    let config = RalphConfig::default()
        .with_criteria(vec![Criterion::new("both", "Pick stdout", both)]);
    let agent = Arc::new(RecordingAgent::new(second_time_lucky, 0));
    let result = orchestrator(config, agent.clone(), factory).run().await;
    assert_eq!(result.status, RunStatus::Success, "{result:?}");

    let requests = agent.requests();
    let context = requests[1].failure_context.as_deref().unwrap();
    assert!(context.contains("from-stdout"), "{context}");
    assert!(!context.contains("from-stderr"), "{context}");
}
