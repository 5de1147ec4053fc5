//! Worker (spec §4.7): drives exactly one Unit through worktree creation,
//! the per-task provider loop, baseline checks, advisory review, merge, and
//! the PR lifecycle. Spawned per-unit by the Pool; teardown always runs,
//! even on failure or cancellation.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{BaselineCheck, CodeReviewConfig, Config, ReviewPollConfig};
use crate::domain::{Task, TaskStatus, Unit};
use crate::events::{Event, EventBus, Severity};
use crate::frontmatter;
use crate::github::{GithubError, PrClient, ReviewState};
use crate::provider::{OutputLine, Provider, ProviderError};
use crate::prompts::PromptLoader;
use crate::reviewer::Reviewer;
use crate::worktree::{MergeResult, WorktreeInfo, WorktreeManager, merge_to_main};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("task {task_number} failed after retries: {detail}")]
    TaskFailed { task_number: u32, detail: String },

    #[error("baseline check {name:?} failed: {output}")]
    BaselineFailed { name: String, output: String },

    #[error("merge conflict after retries in: {}", .conflicted_paths.join(", "))]
    MergeConflict { conflicted_paths: Vec<String> },

    #[error("PR review timed out")]
    ReviewTimeout,

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] eyre::Report),
}

/// The knobs the Worker needs out of `Config`, resolved once per run (not
/// per unit) by the Orchestrator/Pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub target_branch: String,
    pub github_owner: String,
    pub github_repo: String,
    pub max_task_retries: u32,
    pub task_timeout: Duration,
    pub baseline_checks: Vec<BaselineCheck>,
    pub max_conflict_retries: u32,
    pub review: ReviewPollConfig,
    pub code_review: CodeReviewConfig,
    pub worktree_setup: Vec<String>,
    pub worktree_teardown: Vec<String>,
    pub no_pr: bool,
    pub skip_review: bool,
}

impl WorkerConfig {
    pub fn from_config(config: &Config, no_pr: bool, skip_review: bool) -> Self {
        Self {
            target_branch: config.target_branch.clone(),
            github_owner: config.github.owner.clone(),
            github_repo: config.github.repo.clone(),
            max_task_retries: 3,
            task_timeout: Duration::from_secs(1800),
            baseline_checks: config.baseline_checks.clone(),
            max_conflict_retries: config.merge.max_conflict_retries,
            review: config.review.clone(),
            code_review: config.code_review.clone(),
            worktree_setup: config.worktree.setup.clone(),
            worktree_teardown: config.worktree.teardown.clone(),
            no_pr,
            skip_review: skip_review || !config.code_review.enabled,
        }
    }
}

pub struct Worker {
    config: WorkerConfig,
    events: Arc<EventBus>,
    worktree: Arc<WorktreeManager>,
    provider: Arc<dyn Provider>,
    reviewer: Option<Arc<dyn Reviewer>>,
    pr_client: Option<Arc<dyn PrClient>>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        events: Arc<EventBus>,
        worktree: Arc<WorktreeManager>,
        provider: Arc<dyn Provider>,
        reviewer: Option<Arc<dyn Reviewer>>,
        pr_client: Option<Arc<dyn PrClient>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { config, events, worktree, provider, reviewer, pr_client, cancel }
    }

    /// Drive `unit` end to end. Always tears the worktree down before
    /// returning, and always emits exactly one of `UnitCompleted` /
    /// `UnitFailed` for the orchestrator to fold back into scheduler state.
    pub async fn run(&self, unit: &Unit) -> Result<(), WorkerError> {
        self.events.emit(Event::UnitDispatched { unit_id: unit.id.clone() });

        let info = self.worktree.create(&unit.id).await.map_err(eyre::Report::from)?;
        self.events.emit(Event::WorktreeCreated {
            unit_id: unit.id.clone(),
            path: info.path.display().to_string(),
            branch: info.branch.clone(),
        });

        let result = self.run_phases(unit, &info).await;

        let dir_name = format!("{}-{}", info.unit_id, info.nonce);
        if let Err(e) = self.worktree.remove(&dir_name).await {
            warn!(unit_id = %unit.id, error = %e, "worker: worktree removal failed, leaving orphaned directory for cleanup");
        }
        self.events.emit(Event::WorktreeRemoved { unit_id: unit.id.clone() });

        match &result {
            Ok(()) => self.events.emit(Event::UnitCompleted { unit_id: unit.id.clone() }),
            Err(e) => self.events.emit(Event::UnitFailed { unit_id: unit.id.clone(), error: e.to_string() }),
        }

        result
    }

    async fn run_phases(&self, unit: &Unit, info: &WorktreeInfo) -> Result<(), WorkerError> {
        self.run_worktree_setup(&info.path).await?;

        self.check_cancelled()?;
        self.run_task_loop(unit, &info.path).await?;

        self.check_cancelled()?;
        self.run_baseline_checks(unit, &info.path).await?;

        self.check_cancelled()?;
        if !self.config.skip_review {
            self.run_code_review(unit, &info.path).await;
        }

        self.check_cancelled()?;
        self.run_merge(unit, info).await?;

        self.check_cancelled()?;
        if !self.config.no_pr {
            self.run_pr_lifecycle(unit, info).await?;
        }

        self.run_worktree_teardown(&info.path).await;

        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), WorkerError> {
        if self.cancel.is_cancelled() { Err(WorkerError::Cancelled) } else { Ok(()) }
    }

    async fn run_worktree_setup(&self, workdir: &Path) -> Result<(), WorkerError> {
        for cmd in &self.config.worktree_setup {
            run_shell(cmd, workdir).await.map_err(eyre::Report::from)?;
        }
        Ok(())
    }

    async fn run_worktree_teardown(&self, workdir: &Path) {
        for cmd in &self.config.worktree_teardown {
            if let Err(e) = run_shell(cmd, workdir).await {
                warn!(?workdir, command = %cmd, error = %e, "worker: teardown command failed, continuing");
            }
        }
    }

    // === Phase 2: task loop ===

    async fn run_task_loop(&self, unit: &Unit, workdir: &Path) -> Result<(), WorkerError> {
        let mut working = unit.clone();
        let prompts = PromptLoader::new(workdir);

        while let Some(task) = working.next_task().cloned() {
            self.run_one_task(unit, &task, workdir, &prompts).await?;
            for t in working.tasks.iter_mut() {
                if t.number == task.number {
                    t.status = TaskStatus::Complete;
                }
            }
        }

        Ok(())
    }

    async fn run_one_task(&self, unit: &Unit, task: &Task, workdir: &Path, prompts: &PromptLoader) -> Result<(), WorkerError> {
        self.events.emit(Event::TaskStarted { unit_id: unit.id.clone(), task_number: task.number });
        frontmatter::set_field(&task.path, "status", "in_progress").map_err(eyre::Report::from)?;

        let prompt = prompts.task_prompt(&unit.id, task.number, &task.prompt, &task.backpressure).map_err(eyre::Report::from)?;

        for attempt in 1..=self.config.max_task_retries {
            self.check_cancelled()?;
            self.events.emit(Event::TaskProviderInvoked { unit_id: unit.id.clone(), task_number: task.number, attempt });

            let sink_events = self.events.clone();
            let sink_unit = unit.id.clone();
            let sink = move |line: OutputLine| {
                let (text, is_stderr) = match line {
                    OutputLine::Stdout(l) => (l, false),
                    OutputLine::Stderr(l) => (l, true),
                };
                sink_events.emit(Event::TaskProviderOutput {
                    unit_id: sink_unit.clone(),
                    task_number: task.number,
                    line: text,
                    is_stderr,
                });
            };

            let invoke_result =
                self.provider.invoke(&prompt, workdir, self.config.task_timeout, self.cancel.child_token(), &sink).await;

            match invoke_result {
                Err(ProviderError::ContextCancelled) => return Err(WorkerError::Cancelled),
                Err(e) => {
                    warn!(unit_id = %unit.id, task = task.number, attempt, error = %e, "worker: provider invocation failed");
                    if attempt == self.config.max_task_retries {
                        let err = WorkerError::TaskFailed { task_number: task.number, detail: e.to_string() };
                        self.events.emit(Event::TaskFailed { unit_id: unit.id.clone(), task_number: task.number, error: err.to_string() });
                        return Err(err);
                    }
                    continue;
                }
                Ok(()) => {}
            }

            let task_content = std::fs::read_to_string(&task.path).map_err(eyre::Report::from)?;
            let (fm, _body): (TaskStatusFrontmatter, String) = frontmatter::parse(&task_content).map_err(eyre::Report::from)?;

            if fm.status != "complete" {
                warn!(unit_id = %unit.id, task = task.number, attempt, "worker: provider exited zero but did not mark task complete");
                frontmatter::set_field(&task.path, "status", "in_progress").map_err(eyre::Report::from)?;
                if attempt == self.config.max_task_retries {
                    let err = WorkerError::TaskFailed { task_number: task.number, detail: "provider never marked task complete".into() };
                    self.events.emit(Event::TaskFailed { unit_id: unit.id.clone(), task_number: task.number, error: err.to_string() });
                    return Err(err);
                }
                continue;
            }

            self.events.emit(Event::TaskBackpressureRun { unit_id: unit.id.clone(), task_number: task.number, command: task.backpressure.clone() });
            let backpressure_output = run_shell(&task.backpressure, workdir).await;

            match backpressure_output {
                Ok(output) if output.status.success() => {
                    self.events.emit(Event::TaskCompleted { unit_id: unit.id.clone(), task_number: task.number });
                    return Ok(());
                }
                Ok(output) => {
                    let detail = String::from_utf8_lossy(&output.stdout).to_string() + &String::from_utf8_lossy(&output.stderr);
                    warn!(unit_id = %unit.id, task = task.number, attempt, "worker: backpressure command failed");
                    frontmatter::set_field(&task.path, "status", "in_progress").map_err(eyre::Report::from)?;
                    if attempt == self.config.max_task_retries {
                        let err = WorkerError::TaskFailed { task_number: task.number, detail };
                        self.events.emit(Event::TaskFailed { unit_id: unit.id.clone(), task_number: task.number, error: err.to_string() });
                        return Err(err);
                    }
                }
                Err(e) => return Err(WorkerError::Internal(e.into())),
            }
        }

        unreachable!("loop always returns before exhausting retries")
    }

    // === Phase 3: baseline checks ===

    async fn run_baseline_checks(&self, unit: &Unit, workdir: &Path) -> Result<(), WorkerError> {
        let changed = changed_files(workdir).await.unwrap_or_default();

        for check in &self.config.baseline_checks {
            if let Some(pattern) = &check.pattern {
                let applies = glob::Pattern::new(pattern).map(|p| changed.iter().any(|f| p.matches(f))).unwrap_or(true);
                if !applies {
                    continue;
                }
            }

            self.events.emit(Event::BaselineStarted { unit_id: unit.id.clone(), name: check.name.clone() });
            let output = run_shell(&check.command, workdir).await.map_err(eyre::Report::from)?;

            if !output.status.success() {
                let combined = String::from_utf8_lossy(&output.stdout).to_string() + &String::from_utf8_lossy(&output.stderr);
                self.events.emit(Event::BaselineFailed { unit_id: unit.id.clone(), name: check.name.clone(), output: combined.clone() });
                return Err(WorkerError::BaselineFailed { name: check.name.clone(), output: combined });
            }
        }

        self.events.emit(Event::BaselinePassed { unit_id: unit.id.clone() });
        Ok(())
    }

    // === Phase 4: advisory code review ===

    async fn run_code_review(&self, unit: &Unit, workdir: &Path) {
        let Some(reviewer) = &self.reviewer else { return };

        self.events.emit(Event::CodeReviewStarted { unit_id: unit.id.clone() });
        let review = match reviewer.review(workdir, &self.config.target_branch).await {
            Ok(r) => r,
            Err(e) => {
                warn!(unit_id = %unit.id, error = %e, "worker: reviewer failed to execute, skipping (advisory)");
                self.events.emit(Event::CodeReviewFailed { unit_id: unit.id.clone(), error: e.to_string() });
                return;
            }
        };

        if review.issues.is_empty() {
            self.events.emit(Event::CodeReviewPassed { unit_id: unit.id.clone() });
            return;
        }

        self.events.emit(Event::CodeReviewIssuesFound { unit_id: unit.id.clone(), issue_count: review.issues.len() });

        if self.config.code_review.max_fix_iterations == 0 {
            return;
        }

        let prompts = PromptLoader::new(workdir);
        let sink = |_line: OutputLine| {};
        let mut issues = review.issues;

        for attempt in 1..=self.config.code_review.max_fix_iterations {
            let Ok(prompt) = prompts.code_review_fix_prompt(&self.config.target_branch, &issues) else { return };

            match self.provider.invoke(&prompt, workdir, self.config.task_timeout, self.cancel.child_token(), &sink).await {
                Ok(()) => {
                    let _ = run_shell("git add -A", workdir).await;
                    let _ = run_shell("git commit -m \"address code review feedback\" --allow-empty", workdir).await;
                }
                Err(e) => {
                    warn!(unit_id = %unit.id, error = %e, attempt, "worker: code review fix attempt failed, proceeding to merge anyway");
                    return;
                }
            }

            match reviewer.review(workdir, &self.config.target_branch).await {
                Ok(r) if r.issues.is_empty() => {
                    self.events.emit(Event::CodeReviewPassed { unit_id: unit.id.clone() });
                    return;
                }
                Ok(r) => issues = r.issues,
                Err(e) => {
                    warn!(unit_id = %unit.id, error = %e, attempt, "worker: re-review after fix attempt failed, proceeding to merge anyway");
                    return;
                }
            }
        }
    }

    // === Phase 5: commit & merge ===

    async fn run_merge(&self, unit: &Unit, info: &WorktreeInfo) -> Result<(), WorkerError> {
        let repo_root = self.worktree.config().repo_root.clone();
        let git_lock = self.worktree.git_lock();
        let max_attempts = self.config.max_conflict_retries.max(1);

        for attempt in 1..=max_attempts {
            self.check_cancelled()?;
            let guard = git_lock.lock().await;
            let result = merge_to_main(&repo_root, &info.path, &info.branch, &self.config.target_branch, &unit.id)
                .await
                .map_err(WorkerError::Internal)?;
            drop(guard);

            match result {
                MergeResult::Success => {
                    self.events.emit(Event::MergeCompleted { unit_id: unit.id.clone() });
                    return Ok(());
                }
                MergeResult::PushFailed { message } => {
                    return Err(WorkerError::Internal(eyre::eyre!("push to {} failed: {message}", self.config.target_branch)));
                }
                MergeResult::Conflict { conflicted_paths, .. } => {
                    self.events.emit(Event::MergeConflict { unit_id: unit.id.clone(), conflicted_paths: conflicted_paths.clone() });

                    if attempt == max_attempts {
                        return Err(WorkerError::MergeConflict { conflicted_paths });
                    }

                    self.resolve_merge_conflict(&repo_root, &info.branch, &conflicted_paths).await;
                }
            }
        }

        unreachable!("loop always returns before exhausting retries")
    }

    async fn resolve_merge_conflict(&self, repo_root: &Path, branch: &str, conflicted_paths: &[String]) {
        let prompts = PromptLoader::new(repo_root);
        let Ok(prompt) = prompts.merge_conflict_prompt(branch, &self.config.target_branch, conflicted_paths) else {
            let _ = run_shell("git merge --abort", repo_root).await;
            return;
        };

        let sink = |_line: OutputLine| {};
        let invoked = self.provider.invoke(&prompt, repo_root, self.config.task_timeout, self.cancel.child_token(), &sink).await;
        if invoked.is_err() {
            let _ = run_shell("git merge --abort", repo_root).await;
            return;
        }

        let _ = run_shell("git add -A", repo_root).await;
        let committed = run_shell("git commit --no-edit", repo_root).await;
        if committed.map(|o| !o.status.success()).unwrap_or(true) {
            let _ = run_shell("git merge --abort", repo_root).await;
        }
    }

    // === Phase 6: PR lifecycle ===

    async fn run_pr_lifecycle(&self, unit: &Unit, info: &WorktreeInfo) -> Result<(), WorkerError> {
        let Some(pr_client) = &self.pr_client else { return Ok(()) };

        let push = run_shell(&format!("git push origin {}", info.branch), &info.path).await;
        if push.map(|o| !o.status.success()).unwrap_or(true) {
            warn!(unit_id = %unit.id, "worker: pushing feature branch for PR failed; skipping PR creation");
            return Ok(());
        }

        let title = format!("conductor: {}", unit.id);
        let body = format!("Automated PR for unit `{}`.", unit.id);
        let handle = pr_client
            .create_pr(&self.config.github_owner, &self.config.github_repo, &info.branch, &self.config.target_branch, &title, &body)
            .await
            .map_err(|e| WorkerError::Internal(e.into()))?;

        self.events.emit(Event::PrCreated { unit_id: unit.id.clone(), number: handle.number, url: handle.url.clone() });

        let timeout = Duration::from_secs(self.config.review.timeout_secs);
        let poll_interval = Duration::from_secs(self.config.review.poll_interval_secs);
        let deadline = tokio::time::Instant::now() + timeout;
        let prompts = PromptLoader::new(&info.path);

        loop {
            self.check_cancelled()?;

            let state = self.poll_review_state(pr_client, handle.number).await?;
            match state {
                ReviewState::Approved => {
                    if let Err(e) = pr_client.merge_pr(&self.config.github_owner, &self.config.github_repo, handle.number).await {
                        warn!(unit_id = %unit.id, error = %e, "worker: github merge_pr failed (content already merged locally)");
                    }
                    self.events.emit(Event::PrMerged { unit_id: unit.id.clone(), number: handle.number });
                    return Ok(());
                }
                ReviewState::ChangesRequested => {
                    self.events
                        .emit(Event::PrReviewStateChanged { unit_id: unit.id.clone(), number: handle.number, state: "changes_requested".into() });
                    let feedback = format!("Changes were requested on PR #{}.", handle.number);
                    if let Ok(prompt) = prompts.pr_review_feedback_prompt(&unit.id, handle.number, &feedback) {
                        let sink = |_line: OutputLine| {};
                        let _ = self.provider.invoke(&prompt, &info.path, self.config.task_timeout, self.cancel.child_token(), &sink).await;
                        let _ = run_shell("git add -A", &info.path).await;
                        let _ = run_shell("git commit -m \"address review feedback\" --allow-empty", &info.path).await;
                        let _ = run_shell(&format!("git push origin {}", info.branch), &info.path).await;
                    }
                }
                ReviewState::Pending => {}
            }

            if tokio::time::Instant::now() >= deadline {
                self.events.emit(Event::PrReviewTimeout { unit_id: unit.id.clone(), number: handle.number });
                self.events.emit(Event::Escalated {
                    unit_id: unit.id.clone(),
                    severity: Severity::Warning,
                    message: format!("PR #{} review timed out", handle.number),
                });
                return Err(WorkerError::ReviewTimeout);
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = self.cancel.cancelled() => return Err(WorkerError::Cancelled),
            }
        }
    }

    async fn poll_review_state(&self, pr_client: &Arc<dyn PrClient>, number: u64) -> Result<ReviewState, WorkerError> {
        pr_client
            .review_state(&self.config.github_owner, &self.config.github_repo, number)
            .await
            .map_err(|e: GithubError| WorkerError::Internal(e.into()))
    }
}

#[derive(Debug, serde::Deserialize)]
struct TaskStatusFrontmatter {
    status: String,
}

async fn run_shell(command: &str, workdir: &Path) -> Result<std::process::Output> {
    Command::new("sh").arg("-c").arg(command).current_dir(workdir).stdout(Stdio::piped()).stderr(Stdio::piped()).output().await.map_err(Into::into)
}

async fn changed_files(workdir: &Path) -> Result<Vec<String>> {
    let output = Command::new("git").args(["status", "--porcelain"]).current_dir(workdir).output().await?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.get(3..).map(|s| s.to_string()))
        .collect())
}
