//! Orchestrator (spec §4.9): wires discovery → schedule → pool, runs the
//! dispatch loop, folds completion events back into scheduler state, and
//! drives graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{Unit, UnitStatus};
use crate::escalator::Escalator;
use crate::events::{Event, EventBus};
use crate::github::PrClient;
use crate::pool::Pool;
use crate::scheduler::{DispatchResult, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Complete,
    ExecutionBlocked,
    Cancelled,
}

pub struct OrchestratorConfig {
    pub parallelism: usize,
    pub dispatch_poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub feature_mode: bool,
    pub feature_branch: String,
    pub target_branch: String,
    pub github_owner: String,
    pub github_repo: String,
}

pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    pool: Arc<Pool>,
    events: Arc<EventBus>,
    escalator: Arc<Escalator>,
    pr_client: Option<Arc<dyn PrClient>>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        scheduler: Arc<Scheduler>,
        pool: Arc<Pool>,
        events: Arc<EventBus>,
        escalator: Arc<Escalator>,
        pr_client: Option<Arc<dyn PrClient>>,
        config: OrchestratorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self { scheduler, pool, events, escalator, pr_client, config, cancel }
    }

    /// Build the schedule from `units` and drive the dispatch loop to
    /// completion, blockage, or cancellation (spec §4.9's pseudocode).
    pub async fn run(&self, units: Vec<Unit>) -> Result<RunOutcome> {
        let total_units = units.len();
        self.scheduler.schedule(units).await?;
        self.events.emit(Event::RunStarted { total_units, parallelism: self.config.parallelism });

        let subscriber = self.spawn_event_subscriber();

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }

            match self.scheduler.dispatch().await {
                DispatchResult::Unit(id) => {
                    self.pool.reap_finished().await;
                    match self.scheduler.get_unit(&id).await {
                        Some(unit) => {
                            if self.pool.submit(unit).await.is_err() {
                                warn!(unit_id = %id, "orchestrator: pool rejected submission at capacity");
                                self.scheduler.fail(&id, "pool rejected submission at capacity").await;
                            }
                        }
                        None => self.scheduler.fail(&id, "unit vanished from scheduler state").await,
                    }
                }
                DispatchResult::AtCapacity | DispatchResult::NoReady => {
                    self.pool.reap_finished().await;
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.dispatch_poll_interval) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
                DispatchResult::AllBlocked => {
                    let states = self.scheduler.get_all_states().await;
                    let complete = states.values().filter(|s| s.status == UnitStatus::Complete).count();
                    let failed = states.values().filter(|s| s.status == UnitStatus::Failed).count();
                    let blocked = states.values().filter(|s| s.status == UnitStatus::Blocked).count();
                    self.events.emit(Event::RunBlocked { complete, failed, blocked });
                    break RunOutcome::ExecutionBlocked;
                }
                DispatchResult::AllComplete => {
                    if self.config.feature_mode {
                        self.create_feature_pr(&units_summary(&self.scheduler).await).await;
                    }
                    self.events.emit(Event::RunComplete { total_units });
                    break RunOutcome::Complete;
                }
            }
        };

        self.pool.shutdown().await;
        self.escalator.flush(self.config.shutdown_timeout).await;
        subscriber.abort();

        if outcome == RunOutcome::Cancelled {
            self.events.emit(Event::RunCancelled);
        }

        Ok(outcome)
    }

    /// Folds `UnitCompleted`/`UnitFailed` events back into scheduler state
    /// and dispatches escalations — kept off the dispatch loop's hot path
    /// by running as its own task, per spec §4.9.
    fn spawn_event_subscriber(&self) -> JoinHandle<()> {
        let events = self.events.clone();
        let mut subscriber = self.events.subscribe();
        let scheduler = self.scheduler.clone();
        let escalator = self.escalator.clone();

        tokio::spawn(async move {
            while let Some(envelope) = subscriber.recv(&events).await {
                match envelope.event {
                    Event::UnitCompleted { unit_id } => {
                        info!(%unit_id, "orchestrator: unit completed");
                        scheduler.complete(&unit_id).await;
                    }
                    Event::UnitFailed { unit_id, error } => {
                        warn!(%unit_id, %error, "orchestrator: unit failed");
                        scheduler.fail(&unit_id, error.clone()).await;
                        escalator.escalate(unit_id, error);
                    }
                    _ => {}
                }
            }
        })
    }

    /// Pushes the accumulated feature branch and opens a single PR
    /// summarising every unit id (spec §4.9's aggregate feature-mode PR).
    async fn create_feature_pr(&self, unit_ids: &[String]) {
        let Some(pr_client) = &self.pr_client else { return };

        let title = format!("conductor: {} units", unit_ids.len());
        let body = format!("Units completed in this run:\n\n{}", unit_ids.iter().map(|id| format!("- {id}")).collect::<Vec<_>>().join("\n"));

        match pr_client
            .create_pr(&self.config.github_owner, &self.config.github_repo, &self.config.feature_branch, &self.config.target_branch, &title, &body)
            .await
        {
            Ok(handle) => {
                self.events.emit(Event::FeaturePrCreated { number: handle.number, url: handle.url, unit_ids: unit_ids.to_vec() });
            }
            Err(e) => warn!(error = %e, "orchestrator: failed to create aggregate feature PR"),
        }
    }
}

async fn units_summary(scheduler: &Scheduler) -> Vec<String> {
    let states = scheduler.get_all_states().await;
    let mut ids: Vec<String> = states.into_iter().filter(|(_, s)| s.status == UnitStatus::Complete).map(|(id, _)| id).collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodeReviewConfig, ReviewPollConfig};
    use crate::events::create_event_bus;
    use crate::github::ReviewState;
    use crate::github::fake::FakePrClient;
    use crate::pool::ProviderFactory;
    use crate::provider::Provider;
    use crate::provider::mock::MockProvider;
    use crate::worker::WorkerConfig;
    use crate::worktree::{WorktreeConfig, WorktreeManager};
    use tempfile::tempdir;
    use tokio::process::Command;

    async fn setup_git_repo(dir: &std::path::Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["branch", "-M", "main"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    fn independent_unit(id: &str) -> Unit {
        Unit { id: id.to_string(), dir: "/tmp".into(), plan_file: "/tmp/plan.md".into(), depends_on: vec![], tasks: vec![], provider: None }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            target_branch: "main".to_string(),
            github_owner: "acme".to_string(),
            github_repo: "widgets".to_string(),
            max_task_retries: 1,
            task_timeout: Duration::from_secs(5),
            baseline_checks: vec![],
            max_conflict_retries: 1,
            review: ReviewPollConfig { timeout_secs: 1, poll_interval_secs: 1 },
            code_review: CodeReviewConfig { enabled: false, ..Default::default() },
            worktree_setup: vec![],
            worktree_teardown: vec![],
            no_pr: true,
            skip_review: true,
        }
    }

    #[tokio::test]
    async fn two_independent_units_both_complete() {
        let repo_dir = tempdir().unwrap();
        setup_git_repo(repo_dir.path()).await;
        let worktree = Arc::new(WorktreeManager::new(WorktreeConfig {
            base_dir: tempdir().unwrap().path().to_path_buf(),
            repo_root: repo_dir.path().to_path_buf(),
            target_branch: "main".to_string(),
            min_disk_space_gb: 0,
            branch_prefix: "conductor".to_string(),
        }));

        let events = create_event_bus();
        let escalator = Arc::new(Escalator::new(Arc::new(crate::escalator::TerminalSink), 10));
        let factory: Arc<ProviderFactory> = Arc::new(|_unit: &Unit| Arc::new(MockProvider::new("mock", vec![Ok(())])) as Arc<dyn Provider>);
        let pool = Arc::new(Pool::new(
            2,
            Duration::from_secs(5),
            events.clone(),
            worktree,
            None,
            None,
            worker_config(),
            factory,
            CancellationToken::new(),
        ));
        let scheduler = Arc::new(Scheduler::new(2));

        let config = OrchestratorConfig {
            parallelism: 2,
            dispatch_poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            feature_mode: false,
            feature_branch: "feature".to_string(),
            target_branch: "main".to_string(),
            github_owner: "acme".to_string(),
            github_repo: "widgets".to_string(),
        };

        let orchestrator = Orchestrator::new(scheduler.clone(), pool, events, escalator, None, config, CancellationToken::new());

        let units = vec![independent_unit("unit-a"), independent_unit("unit-b")];
        let outcome = orchestrator.run(units).await.unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        let states = scheduler.get_all_states().await;
        assert!(states.values().all(|s| s.status == UnitStatus::Complete));
    }

    #[tokio::test]
    async fn failure_cascades_to_blocked() {
        let repo_dir = tempdir().unwrap();
        setup_git_repo(repo_dir.path()).await;
        let worktree = Arc::new(WorktreeManager::new(WorktreeConfig {
            base_dir: tempdir().unwrap().path().to_path_buf(),
            repo_root: repo_dir.path().to_path_buf(),
            target_branch: "main".to_string(),
            min_disk_space_gb: 0,
            branch_prefix: "conductor".to_string(),
        }));

        let events = create_event_bus();
        let escalator = Arc::new(Escalator::new(Arc::new(crate::escalator::TerminalSink), 10));
        let factory: Arc<ProviderFactory> = Arc::new(|_unit: &Unit| Arc::new(MockProvider::new("mock", vec![Err("boom".to_string())])) as Arc<dyn Provider>);

        let mut cfg = worker_config();
        cfg.baseline_checks = vec![crate::config::BaselineCheck { name: "always-fails".to_string(), command: "exit 1".to_string(), pattern: None }];

        let pool = Arc::new(Pool::new(
            2,
            Duration::from_secs(5),
            events.clone(),
            worktree,
            None,
            None,
            cfg,
            factory,
            CancellationToken::new(),
        ));
        let scheduler = Arc::new(Scheduler::new(2));

        let config = OrchestratorConfig {
            parallelism: 2,
            dispatch_poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            feature_mode: false,
            feature_branch: "feature".to_string(),
            target_branch: "main".to_string(),
            github_owner: "acme".to_string(),
            github_repo: "widgets".to_string(),
        };

        let orchestrator = Orchestrator::new(scheduler.clone(), pool, events, escalator, None, config, CancellationToken::new());

        let mut unit_a = independent_unit("unit-a");
        unit_a.tasks = vec![crate::domain::Task {
            number: 1,
            path: repo_dir.path().join("1.md"),
            prompt: "do it".to_string(),
            backpressure: "exit 1".to_string(),
            depends_on: vec![],
            status: crate::domain::TaskStatus::Pending,
        }];
        std::fs::write(&unit_a.tasks[0].path, "---\ntask: 1\nstatus: pending\nbackpressure: \"exit 1\"\n---\nbody\n").unwrap();

        let mut unit_b = independent_unit("unit-b");
        unit_b.depends_on = vec!["unit-a".to_string()];

        let outcome = orchestrator.run(vec![unit_a, unit_b]).await.unwrap();

        assert_eq!(outcome, RunOutcome::ExecutionBlocked);
        let states = scheduler.get_all_states().await;
        assert_eq!(states["unit-a"].status, UnitStatus::Failed);
        assert_eq!(states["unit-b"].status, UnitStatus::Blocked);
    }

    #[tokio::test]
    async fn feature_mode_creates_aggregate_pr_on_success() {
        let repo_dir = tempdir().unwrap();
        setup_git_repo(repo_dir.path()).await;
        let worktree = Arc::new(WorktreeManager::new(WorktreeConfig {
            base_dir: tempdir().unwrap().path().to_path_buf(),
            repo_root: repo_dir.path().to_path_buf(),
            target_branch: "main".to_string(),
            min_disk_space_gb: 0,
            branch_prefix: "conductor".to_string(),
        }));

        let events = create_event_bus();
        let escalator = Arc::new(Escalator::new(Arc::new(crate::escalator::TerminalSink), 10));
        let factory: Arc<ProviderFactory> = Arc::new(|_unit: &Unit| Arc::new(MockProvider::new("mock", vec![Ok(())])) as Arc<dyn Provider>);
        let pool = Arc::new(Pool::new(
            2,
            Duration::from_secs(5),
            events.clone(),
            worktree,
            None,
            None,
            worker_config(),
            factory,
            CancellationToken::new(),
        ));
        let scheduler = Arc::new(Scheduler::new(2));
        let pr_client = Arc::new(FakePrClient::new());
        pr_client.set_review_state(1, ReviewState::Approved);

        let config = OrchestratorConfig {
            parallelism: 2,
            dispatch_poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            feature_mode: true,
            feature_branch: "feature/all-units".to_string(),
            target_branch: "main".to_string(),
            github_owner: "acme".to_string(),
            github_repo: "widgets".to_string(),
        };

        let orchestrator = Orchestrator::new(scheduler, pool, events, escalator, Some(pr_client.clone() as Arc<dyn PrClient>), config, CancellationToken::new());

        let outcome = orchestrator.run(vec![independent_unit("unit-a")]).await.unwrap();
        assert_eq!(outcome, RunOutcome::Complete);

        let created = pr_client.created_prs();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "feature/all-units");
    }
}
