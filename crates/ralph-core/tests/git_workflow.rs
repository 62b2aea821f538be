//! A full sequential run against a local bare remote: clone, branch, loop,
//! commit and push.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use ralph_core::{
    Agent, AgentRequest, AgentResponse, Criterion, GitConfig, Orchestrator, RalphConfig,
    RepositoryConfig, RunStatus,
};
use ralph_runtime::{BackendError, Credentials, ExecuteOptions, ExecutionBackend};

fn git(args: &[&str], dir: &Path) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(out.status.success(), "git {args:?} failed");
    String::from_utf8(out.stdout).unwrap()
}

fn make_remote(root: &Path) -> String {
    let seed = root.join("seed");
    let bare = root.join("remote.git");
    std::fs::create_dir_all(&seed).unwrap();
    git(&["init", "-q", "-b", "main"], &seed);
    std::fs::write(seed.join("README.md"), "seed\n").unwrap();
    git(&["add", "README.md"], &seed);
    git(
        &[
            "-c",
            "user.name=Seed",
            "-c",
            "user.email=seed@example.com",
            "commit",
            "-q",
            "-m",
            "seed",
        ],
        &seed,
    );
    git(
        &["clone", "-q", "--bare", seed.to_str().unwrap(), bare.to_str().unwrap()],
        root,
    );
    bare.to_string_lossy().into_owned()
}

struct WriteFeature;

#[async_trait]
impl Agent for WriteFeature {
    async fn run(
        &self,
        backend: &dyn ExecutionBackend,
        request: &AgentRequest,
    ) -> Result<AgentResponse, BackendError> {
        backend
            .execute(
                "mkdir -p src && echo 'pub fn hello() {}' > src/feature.rs",
                &ExecuteOptions::in_dir(&request.workdir),
            )
            .await?;
        Ok(AgentResponse {
            output: "```progress\nadded src/feature.rs\n```".to_string(),
            usage: Default::default(),
        })
    }
}

#[tokio::test]
async fn sequential_run_pushes_feature_branch() {
    let root = tempfile::tempdir().unwrap();
    let remote = make_remote(root.path());

    let mut config = RalphConfig::default().with_criteria(vec![Criterion::new(
        "feature",
        "Add the feature module",
        "test -f src/feature.rs",
    )]);
    config.repository = Some(RepositoryConfig {
        url: remote.clone(),
        base_branch: "main".to_string(),
        working_dir: None,
        install_command: None,
    });
    config.git = Some(GitConfig::default());

    let result = Orchestrator::new(config, Credentials::default())
        .with_agent(Arc::new(WriteFeature))
        .run()
        .await;

    assert_eq!(result.status, RunStatus::Success, "{result:?}");
    assert_eq!(result.pr_url, None);

    let files = git(
        &["ls-tree", "-r", "--name-only", "feature/ralph"],
        Path::new(&remote),
    );
    assert!(files.lines().any(|f| f == "src/feature.rs"), "{files}");
    assert!(!files.lines().any(|f| f == "progress.txt"), "{files}");
    assert!(!files.lines().any(|f| f.starts_with(".ralph/")), "{files}");

    let message = git(&["log", "-1", "--format=%s", "feature/ralph"], Path::new(&remote));
    assert_eq!(message.trim(), "feat: Add the feature module");
}

#[tokio::test]
async fn failing_install_command_is_a_run_error() {
    let root = tempfile::tempdir().unwrap();
    let remote = make_remote(root.path());

    let mut config = RalphConfig::default()
        .with_criteria(vec![Criterion::new("c", "anything", "true")]);
    config.repository = Some(RepositoryConfig {
        url: remote,
        base_branch: "main".to_string(),
        working_dir: None,
        install_command: Some("exit 3".to_string()),
    });
    config.git = Some(GitConfig::default());

    let result = Orchestrator::new(config, Credentials::default())
        .with_agent(Arc::new(WriteFeature))
        .run()
        .await;

    assert_eq!(result.status, RunStatus::Error);
    assert!(result.error.unwrap().contains("install command exited with 3"));
    assert_eq!(result.total_iterations, 0);
}
