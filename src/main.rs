//! conductor - parallel development orchestrator
//!
//! CLI entry point: parses arguments, loads configuration, and dispatches to
//! the `run`/`status`/`prompt`/`cleanup` commands (spec §6).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use conductor::cli::{Cli, Command};
use conductor::config::Config;
use conductor::domain::{TaskStatus, Unit};
use conductor::{
    CliProvider, CliReviewer, EscalationSink, Escalator, EventBus, EventEnvelope, GithubClient, MultiSink,
    Orchestrator, OrchestratorConfig, Pool, PrClient, PromptLoader, Provider, ProviderFactory, Reviewer,
    RunOutcome, Scheduler, TerminalSink, WebhookSink, WorkerConfig, WorktreeConfig, WorktreeManager,
    create_event_bus, discover, resolve_provider_id,
};

fn setup_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(cli.verbose) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::from(2);
    }

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "conductor: fatal error");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    let config_path = cli.config.clone();
    match cli.command {
        Command::Run {
            tasks_dir,
            dry_run,
            unit,
            parallelism,
            target_branch,
            no_pr,
            skip_review,
            provider,
            force_task_provider,
            no_tui,
        } => {
            run_command(
                config_path,
                tasks_dir,
                dry_run,
                unit,
                parallelism,
                target_branch,
                no_pr,
                skip_review,
                provider,
                force_task_provider,
                no_tui,
            )
            .await
        }
        Command::Status { tasks_dir } => status_command(tasks_dir).await,
        Command::Prompt { unit, tasks_dir } => prompt_command(tasks_dir, unit).await,
        Command::Cleanup { worktree_base } => cleanup_command(config_path, worktree_base).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    config_path: Option<PathBuf>,
    tasks_dir: PathBuf,
    dry_run: bool,
    unit_filter: Option<String>,
    parallelism: Option<usize>,
    target_branch: Option<String>,
    no_pr: bool,
    skip_review: bool,
    provider: Option<String>,
    force_task_provider: Option<String>,
    no_tui: bool,
) -> Result<u8> {
    let repo_root = std::env::current_dir().context("failed to determine current directory")?;

    let mut config = Config::load(config_path.as_ref()).context("failed to load configuration")?;
    config.resolve_github(&repo_root).context("failed to auto-detect github owner/repo from git remote")?;

    if let Some(p) = parallelism {
        config.parallelism = p;
    }
    if let Some(branch) = target_branch {
        config.target_branch = branch;
    }

    let mut units = discover(&tasks_dir).context("failed to discover units")?;
    if let Some(id) = &unit_filter {
        units.retain(|u| &u.id == id);
        if units.is_empty() {
            eyre::bail!("no unit {id:?} found under {}", tasks_dir.display());
        }
    }

    if dry_run {
        for unit in &units {
            println!("{} (depends_on: [{}])", unit.id, unit.depends_on.join(", "));
        }
        return Ok(0);
    }

    let events = create_event_bus();
    let cancel = CancellationToken::new();

    let worktree = Arc::new(WorktreeManager::new(WorktreeConfig {
        base_dir: config.worktree.base_path.clone(),
        repo_root: repo_root.clone(),
        target_branch: config.target_branch.clone(),
        min_disk_space_gb: 5,
        branch_prefix: "conductor".to_string(),
    }));

    let reviewer: Option<Arc<dyn Reviewer>> = if !skip_review && config.code_review.enabled {
        let mut reviewer_config = config.provider.providers.get(&config.code_review.provider).cloned().unwrap_or_default();
        if let Some(command) = &config.code_review.command {
            reviewer_config.command = command.clone();
        }
        Some(Arc::new(CliReviewer::from_config(&config.code_review.provider, &reviewer_config)))
    } else {
        None
    };

    let pr_client: Option<Arc<dyn PrClient>> = if no_pr {
        None
    } else {
        match std::env::var("GITHUB_TOKEN") {
            Ok(token) => Some(Arc::new(GithubClient::new(token))),
            Err(_) => {
                warn!("GITHUB_TOKEN not set, pull requests will not be created");
                None
            }
        }
    };

    let provider_factory = build_provider_factory(&config, provider, force_task_provider);

    let worker_config = WorkerConfig::from_config(&config, no_pr, skip_review);
    let escalator = Arc::new(build_escalator());

    let pool = Arc::new(Pool::new(
        config.parallelism,
        Duration::from_secs(60),
        events.clone(),
        worktree,
        reviewer,
        pr_client.clone(),
        worker_config,
        provider_factory,
        cancel.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(config.parallelism));

    let orchestrator_config = OrchestratorConfig {
        parallelism: config.parallelism,
        dispatch_poll_interval: Duration::from_millis(200),
        shutdown_timeout: Duration::from_secs(60),
        feature_mode: false,
        feature_branch: "conductor/feature-batch".to_string(),
        target_branch: config.target_branch.clone(),
        github_owner: config.github.owner.clone(),
        github_repo: config.github.repo.clone(),
    };

    let orchestrator =
        Orchestrator::new(scheduler, pool, events.clone(), escalator, pr_client, orchestrator_config, cancel.clone());

    spawn_event_logger(events, no_tui);

    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("conductor: received ctrl-c, cancelling run");
            cancel_on_signal.cancel();
        }
    });

    let outcome = orchestrator.run(units).await.context("orchestrator run failed")?;

    match outcome {
        RunOutcome::Complete => Ok(0),
        RunOutcome::ExecutionBlocked => Ok(1),
        RunOutcome::Cancelled => Ok(130),
    }
}

/// Builds the per-unit provider resolver honoring spec §4.2's precedence
/// chain: `--force-task-provider` > unit frontmatter > `--provider` >
/// `CONDUCTOR_PROVIDER` env var > configured default.
fn build_provider_factory(config: &Config, cli_default: Option<String>, force_override: Option<String>) -> Arc<ProviderFactory> {
    let env_default = std::env::var("CONDUCTOR_PROVIDER").ok();
    let providers = config.provider.providers.clone();
    let config_default = config.provider.default_id.clone();

    Arc::new(move |unit: &Unit| {
        let id = resolve_provider_id(
            force_override.as_deref(),
            unit.provider.as_deref(),
            cli_default.as_deref(),
            env_default.as_deref(),
            &config_default,
        );
        let provider_config = providers.get(&id).cloned().unwrap_or_default();
        Arc::new(CliProvider::from_config(&id, &provider_config)) as Arc<dyn Provider>
    })
}

fn build_escalator() -> Escalator {
    let mut sinks: Vec<Arc<dyn EscalationSink>> = vec![Arc::new(TerminalSink)];
    if let Ok(url) = std::env::var("CONDUCTOR_WEBHOOK_URL") {
        sinks.push(Arc::new(WebhookSink::new(url)));
    }
    Escalator::new(Arc::new(MultiSink::new(sinks)), 16)
}

/// Drains the event bus for the lifetime of the run, printing either JSON
/// lines (`--no-tui`, per the event-stream contract in spec §6) or a
/// colorized one-line-per-event summary.
fn spawn_event_logger(events: Arc<EventBus>, json_lines: bool) {
    let mut subscriber = events.subscribe();
    tokio::spawn(async move {
        while let Some(envelope) = subscriber.recv(&events).await {
            if json_lines {
                if let Ok(line) = serde_json::to_string(&envelope) {
                    println!("{line}");
                }
            } else {
                print_human_event(&envelope);
            }
        }
    });
}

fn print_human_event(envelope: &EventEnvelope) {
    let label = envelope.event.event_type();
    match envelope.event.unit_id() {
        Some(unit_id) => println!("{} {}", label.blue(), format!("[{unit_id}]").dimmed()),
        None => println!("{}", label.blue().bold()),
    }
}

async fn status_command(tasks_dir: PathBuf) -> Result<u8> {
    let units = discover(&tasks_dir).context("failed to discover units")?;

    for unit in &units {
        let overall = if unit.all_tasks_complete() {
            "complete".green()
        } else if unit.tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            "failed".red()
        } else {
            "pending".yellow()
        };
        println!("{} [{overall}] depends_on: [{}]", unit.id.bold(), unit.depends_on.join(", "));
        for task in &unit.tasks {
            println!("  #{:<3} {:<12} {}", task.number, task.status.to_string(), task.backpressure);
        }
    }

    Ok(0)
}

async fn prompt_command(tasks_dir: PathBuf, unit_id: String) -> Result<u8> {
    let units = discover(&tasks_dir).context("failed to discover units")?;
    let unit = units
        .into_iter()
        .find(|u| u.id == unit_id)
        .ok_or_else(|| eyre::eyre!("no unit {unit_id:?} found under {}", tasks_dir.display()))?;
    let task = unit.next_task().ok_or_else(|| eyre::eyre!("unit {unit_id:?} has no pending task"))?;

    let repo_root = std::env::current_dir().context("failed to determine current directory")?;
    let loader = PromptLoader::new(repo_root);
    let prompt = loader
        .task_prompt(&unit.id, task.number, &task.prompt, &task.backpressure)
        .context("failed to render task prompt")?;

    println!("{prompt}");
    Ok(0)
}

async fn cleanup_command(config_path: Option<PathBuf>, worktree_base: Option<PathBuf>) -> Result<u8> {
    let repo_root = std::env::current_dir().context("failed to determine current directory")?;
    let config = Config::load(config_path.as_ref()).context("failed to load configuration")?;
    let base_dir = worktree_base.unwrap_or_else(|| config.worktree.base_path.clone());

    let manager = WorktreeManager::new(WorktreeConfig {
        base_dir,
        repo_root,
        target_branch: config.target_branch.clone(),
        min_disk_space_gb: 0,
        branch_prefix: "conductor".to_string(),
    });

    let removed = manager.cleanup_orphaned(&[]).await.context("failed to clean up worktrees")?;
    println!("removed {removed} stale worktree(s)");
    Ok(0)
}
