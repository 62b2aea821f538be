//! Ralph - autonomous generate/verify/retry loop for acceptance criteria
//!
//! ## Commands
//!
//! - `run`: execute every criterion of a configuration
//! - `validate`: check a configuration without creating any backend

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ralph_core::{Orchestrator, RalphConfig, RunMode, TracingTelemetry};
use ralph_runtime::{Credentials, RuntimeKind};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "ralph")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive a coding agent until every acceptance criterion passes", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    credentials: CredentialArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct CredentialArgs {
    /// API key handed to the agent
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true, global = true)]
    anthropic_api_key: Option<String>,

    /// Token used to clone, push and open pull requests
    #[arg(long, env = "GITHUB_PAT", hide_env_values = true, global = true)]
    git_token: Option<String>,

    /// Cloud sandbox provider API key
    #[arg(long, env = "DAYTONA_API_KEY", hide_env_values = true, global = true)]
    cloud_api_key: Option<String>,

    /// Cloud sandbox provider URL
    #[arg(long, env = "DAYTONA_API_URL", global = true)]
    cloud_api_url: Option<String>,
}

impl From<CredentialArgs> for Credentials {
    fn from(args: CredentialArgs) -> Self {
        Credentials {
            anthropic_api_key: args.anthropic_api_key,
            git_token: args.git_token,
            cloud_api_key: args.cloud_api_key,
            cloud_api_url: args.cloud_api_url,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the loop and print the result as JSON
    Run {
        /// Path to the run configuration
        #[arg(short, long, default_value = "ralph.json")]
        config: PathBuf,

        /// Override the configured runtime (local, container, cloud-sandbox)
        #[arg(long)]
        runtime: Option<RuntimeKind>,

        /// Override the configured mode
        #[arg(long, value_parser = parse_mode)]
        mode: Option<RunMode>,
    },

    /// Validate a configuration
    Validate {
        /// Path to the run configuration
        #[arg(short, long, default_value = "ralph.json")]
        config: PathBuf,
    },
}

fn parse_mode(s: &str) -> Result<RunMode, String> {
    match s {
        "sequential" => Ok(RunMode::Sequential),
        "parallel" => Ok(RunMode::Parallel),
        other => Err(format!("unknown mode {other:?} (expected sequential or parallel)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    ralph_core::init_tracing(cli.json, level);

    let credentials = Credentials::from(cli.credentials);
    match cli.command {
        Commands::Run {
            config,
            runtime,
            mode,
        } => cmd_run(&config, runtime, mode, credentials).await,
        Commands::Validate { config } => cmd_validate(&config),
    }
}

fn load_config(path: &Path) -> Result<RalphConfig> {
    RalphConfig::from_file(path).with_context(|| format!("Failed to load {}", path.display()))
}

async fn cmd_run(
    path: &Path,
    runtime: Option<RuntimeKind>,
    mode: Option<RunMode>,
    credentials: Credentials,
) -> Result<()> {
    let mut config = load_config(path)?;
    if let Some(kind) = runtime {
        config = config.with_runtime(kind);
    }
    if let Some(mode) = mode {
        config = config.with_mode(mode);
    }

    info!(config = %path.display(), "starting run");
    let result = Orchestrator::new(config, credentials)
        .with_telemetry(Arc::new(TracingTelemetry))
        .run()
        .await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    config.validate()?;
    println!(
        "✓ {} valid: {} criteria, {} mode, {} runtime",
        path.display(),
        config.criteria.len(),
        config.mode,
        config.runtime.kind
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_overrides() {
        let cli = Cli::try_parse_from([
            "ralph",
            "run",
            "--config",
            "x.json",
            "--runtime",
            "docker",
            "--mode",
            "parallel",
        ])
        .unwrap();
        let Commands::Run { runtime, mode, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(runtime, Some(RuntimeKind::Container));
        assert_eq!(mode, Some(RunMode::Parallel));
    }

    #[test]
    fn validate_reports_problems() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ralph.json");
        std::fs::write(&path, r#"{"criteria": []}"#).unwrap();
        let err = cmd_validate(&path).unwrap_err();
        assert!(format!("{err:#}").contains("at least one criterion"));

        std::fs::write(
            &path,
            r#"{"criteria": [{"id": "a", "description": "d", "backpressure": "true"}]}"#,
        )
        .unwrap();
        cmd_validate(&path).unwrap();
    }
}
