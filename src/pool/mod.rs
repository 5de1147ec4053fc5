//! Worker Pool (spec §4.8): fixed-size bounded concurrent execution of
//! workers, with a per-unit provider resolved at submit time via a factory
//! so each worker can run against a different LLM binary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::Unit;
use crate::events::EventBus;
use crate::github::PrClient;
use crate::provider::Provider;
use crate::reviewer::Reviewer;
use crate::worker::{Worker, WorkerConfig, WorkerError};
use crate::worktree::WorktreeManager;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool at capacity")]
    AtCapacity,
}

/// Resolves which `Provider` a given unit should run against, applying the
/// precedence chain from spec §4.2 (force-override → unit frontmatter →
/// CLI default → env → config default).
pub type ProviderFactory = dyn Fn(&Unit) -> Arc<dyn Provider> + Send + Sync;

pub struct Pool {
    semaphore: Arc<Semaphore>,
    tasks: Mutex<HashMap<String, JoinHandle<Result<(), WorkerError>>>>,
    shutdown_timeout: Duration,
    events: Arc<EventBus>,
    worktree: Arc<WorktreeManager>,
    reviewer: Option<Arc<dyn Reviewer>>,
    pr_client: Option<Arc<dyn PrClient>>,
    worker_config: WorkerConfig,
    provider_factory: Arc<ProviderFactory>,
    cancel: CancellationToken,
}

impl Pool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capacity: usize,
        shutdown_timeout: Duration,
        events: Arc<EventBus>,
        worktree: Arc<WorktreeManager>,
        reviewer: Option<Arc<dyn Reviewer>>,
        pr_client: Option<Arc<dyn PrClient>>,
        worker_config: WorkerConfig,
        provider_factory: Arc<ProviderFactory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            tasks: Mutex::new(HashMap::new()),
            shutdown_timeout,
            events,
            worktree,
            reviewer,
            pr_client,
            worker_config,
            provider_factory,
            cancel,
        }
    }

    /// Non-blocking: a free slot spawns the worker immediately, otherwise
    /// returns `AtCapacity`. The orchestrator only calls this after
    /// `Scheduler::dispatch` has already confirmed a slot is free, so this
    /// is a defensive check rather than the primary backpressure mechanism.
    pub async fn submit(&self, unit: Unit) -> Result<(), PoolError> {
        let permit = self.semaphore.clone().try_acquire_owned().map_err(|_| PoolError::AtCapacity)?;

        let provider = (self.provider_factory)(&unit);
        let worker = Worker::new(
            self.worker_config.clone(),
            self.events.clone(),
            self.worktree.clone(),
            provider,
            self.reviewer.clone(),
            self.pr_client.clone(),
            self.cancel.child_token(),
        );

        let unit_id = unit.id.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            worker.run(&unit).await
        });

        self.tasks.lock().await.insert(unit_id, handle);
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Drops bookkeeping for any worker task that has already finished.
    /// Outcomes are consumed via the event bus (`UnitCompleted`/`UnitFailed`),
    /// not via this method's return value — this exists purely so the
    /// pool's internal map doesn't grow unboundedly over a long run.
    pub async fn reap_finished(&self) {
        let finished: Vec<(String, JoinHandle<Result<(), WorkerError>>)> = {
            let mut tasks = self.tasks.lock().await;
            let ids: Vec<String> = tasks.iter().filter(|(_, h)| h.is_finished()).map(|(id, _)| id.clone()).collect();
            ids.into_iter().filter_map(|id| tasks.remove(&id).map(|h| (id, h))).collect()
        };

        for (unit_id, handle) in finished {
            if let Err(join_err) = handle.await {
                warn!(%unit_id, error = %join_err, "pool: worker task panicked");
            }
        }
    }

    /// Cancels every active worker, waits up to `shutdown_timeout` for them
    /// to finish tearing down their worktrees, then forcibly aborts
    /// whatever remains.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        loop {
            self.reap_finished().await;
            if self.tasks.lock().await.is_empty() || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut tasks = self.tasks.lock().await;
        for (unit_id, handle) in tasks.drain() {
            if !handle.is_finished() {
                warn!(%unit_id, "pool: shutdown deadline exceeded, aborting worker task");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodeReviewConfig, ReviewPollConfig};
    use crate::domain::Unit;
    use crate::events::create_event_bus;
    use crate::provider::mock::MockProvider;
    use crate::worktree::WorktreeConfig;
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

    fn empty_unit(id: &str) -> Unit {
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
    async fn rejects_submission_beyond_capacity() {
        let repo_dir = tempdir().unwrap();
        setup_git_repo(repo_dir.path()).await;
        let worktree = Arc::new(WorktreeManager::new(WorktreeConfig {
            base_dir: tempdir().unwrap().path().to_path_buf(),
            repo_root: repo_dir.path().to_path_buf(),
            target_branch: "main".to_string(),
            min_disk_space_gb: 0,
            branch_prefix: "conductor".to_string(),
        }));

        let factory: Arc<ProviderFactory> = Arc::new(|_unit: &Unit| Arc::new(MockProvider::new("mock", vec![Ok(())])) as Arc<dyn Provider>);

        let pool = Pool::new(
            1,
            Duration::from_secs(5),
            create_event_bus(),
            worktree,
            None,
            None,
            worker_config(),
            factory,
            CancellationToken::new(),
        );

        assert!(pool.submit(empty_unit("unit-a")).await.is_ok());
        assert!(matches!(pool.submit(empty_unit("unit-b")).await, Err(PoolError::AtCapacity)));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn reap_finished_drains_completed_workers() {
        let repo_dir = tempdir().unwrap();
        setup_git_repo(repo_dir.path()).await;
        let worktree = Arc::new(WorktreeManager::new(WorktreeConfig {
            base_dir: tempdir().unwrap().path().to_path_buf(),
            repo_root: repo_dir.path().to_path_buf(),
            target_branch: "main".to_string(),
            min_disk_space_gb: 0,
            branch_prefix: "conductor".to_string(),
        }));

        let factory: Arc<ProviderFactory> = Arc::new(|_unit: &Unit| Arc::new(MockProvider::new("mock", vec![Ok(())])) as Arc<dyn Provider>);

        let pool = Pool::new(
            2,
            Duration::from_secs(5),
            create_event_bus(),
            worktree,
            None,
            None,
            worker_config(),
            factory,
            CancellationToken::new(),
        );

        pool.submit(empty_unit("unit-a")).await.unwrap();

        // An empty-task unit completes almost immediately (no tasks to run,
        // no baseline checks, no PR); give it a moment then reap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.reap_finished().await;
        assert_eq!(pool.active_count().await, 0);
    }
}
