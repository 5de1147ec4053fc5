//! Integration tests for conductor
//!
//! These tests exercise discovery, scheduling, worktree management, and the
//! event bus together, against real filesystem and git state in a temp dir.

use std::fs;
use std::path::Path;
use std::process::Command as StdCommand;
use std::time::Duration;

use conductor::config::Config;
use conductor::{DispatchResult, Scheduler, WorktreeConfig, WorktreeManager, create_event_bus, discover};
use serial_test::serial;
use tempfile::tempdir;

fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

fn write_unit(root: &Path, dirname: &str, id: &str, depends_on: &[&str]) {
    let unit_dir = root.join(dirname);
    fs::create_dir(&unit_dir).unwrap();
    write(
        &unit_dir,
        "plan.md",
        &format!("---\nunit: {id}\ndepends_on: [{}]\n---\nImplement the thing.\n", depends_on.join(", ")),
    );
    write(
        &unit_dir,
        "1.md",
        "---\ntask: 1\nstatus: pending\nbackpressure: \"cargo check\"\ndepends_on: []\n---\nDo the first task.\n",
    );
}

fn init_repo(path: &Path) {
    let run = |args: &[&str]| {
        let status = StdCommand::new("git").args(args).current_dir(path).status().expect("git available");
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "-q", "-b", "main"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "test"]);
    fs::write(path.join("README.md"), "hello\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-q", "-m", "initial"]);
}

// =============================================================================
// Discovery + Scheduler end-to-end
// =============================================================================

#[tokio::test]
async fn discovers_a_linear_chain_and_dispatches_in_dependency_order() {
    let root = tempdir().unwrap();
    write_unit(root.path(), "a", "unit-a", &[]);
    write_unit(root.path(), "b", "unit-b", &["unit-a"]);
    write_unit(root.path(), "c", "unit-c", &["unit-b"]);

    let units = discover(root.path()).unwrap();
    assert_eq!(units.len(), 3);

    let scheduler = Scheduler::new(2);
    scheduler.schedule(units).await.unwrap();

    assert_eq!(scheduler.dispatch().await, DispatchResult::Unit("unit-a".to_string()));
    assert_eq!(scheduler.dispatch().await, DispatchResult::NoReady);

    scheduler.complete("unit-a").await;
    assert_eq!(scheduler.dispatch().await, DispatchResult::Unit("unit-b".to_string()));

    scheduler.complete("unit-b").await;
    assert_eq!(scheduler.dispatch().await, DispatchResult::Unit("unit-c".to_string()));

    scheduler.complete("unit-c").await;
    assert_eq!(scheduler.dispatch().await, DispatchResult::AllComplete);
}

#[tokio::test]
async fn independent_units_saturate_parallelism_then_drain() {
    let root = tempdir().unwrap();
    write_unit(root.path(), "a", "unit-a", &[]);
    write_unit(root.path(), "b", "unit-b", &[]);
    write_unit(root.path(), "c", "unit-c", &[]);

    let units = discover(root.path()).unwrap();
    let scheduler = Scheduler::new(2);
    scheduler.schedule(units).await.unwrap();

    let first = scheduler.dispatch().await;
    let second = scheduler.dispatch().await;
    assert!(matches!(first, DispatchResult::Unit(_)));
    assert!(matches!(second, DispatchResult::Unit(_)));
    assert_eq!(scheduler.dispatch().await, DispatchResult::AtCapacity);

    if let DispatchResult::Unit(id) = &first {
        scheduler.complete(id).await;
    }
    assert_eq!(scheduler.dispatch().await, DispatchResult::Unit("unit-c".to_string()));
}

// =============================================================================
// Worktree manager against a real repo
// =============================================================================

#[serial]
#[tokio::test]
async fn worktree_manager_creates_validates_and_removes() {
    let repo = tempdir().unwrap();
    init_repo(repo.path());

    let worktrees = tempdir().unwrap();
    let manager = WorktreeManager::new(WorktreeConfig {
        base_dir: worktrees.path().to_path_buf(),
        repo_root: repo.path().to_path_buf(),
        target_branch: "main".to_string(),
        min_disk_space_gb: 0,
        branch_prefix: "conductor".to_string(),
    });

    let info = manager.create("unit-a").await.expect("worktree should be created");
    assert!(info.path.exists());
    assert_eq!(info.unit_id, "unit-a");

    let dir_name = format!("{}-{}", info.unit_id, info.nonce);
    assert!(manager.exists(&dir_name));

    manager.validate(&dir_name).await.expect("freshly created worktree should validate");

    let listed = manager.list().await.expect("list should succeed");
    assert!(listed.iter().any(|w| w.unit_id == "unit-a"));

    manager.remove(&dir_name).await.expect("removal should succeed");
    assert!(!info.path.exists());
}

#[serial]
#[tokio::test]
async fn cleanup_orphaned_removes_worktrees_not_in_the_active_set() {
    let repo = tempdir().unwrap();
    init_repo(repo.path());

    let worktrees = tempdir().unwrap();
    let manager = WorktreeManager::new(WorktreeConfig {
        base_dir: worktrees.path().to_path_buf(),
        repo_root: repo.path().to_path_buf(),
        target_branch: "main".to_string(),
        min_disk_space_gb: 0,
        branch_prefix: "conductor".to_string(),
    });

    manager.create("unit-a").await.unwrap();
    manager.create("unit-b").await.unwrap();

    let removed = manager.cleanup_orphaned(&[]).await.expect("cleanup should succeed");
    assert_eq!(removed, 2);
    assert!(manager.list().await.unwrap().is_empty());
}

// =============================================================================
// Event bus
// =============================================================================

#[tokio::test]
async fn event_bus_delivers_to_multiple_subscribers_and_counts_drops() {
    use conductor::Event;

    let bus = create_event_bus();
    let mut sub_a = bus.subscribe();
    let mut sub_b = bus.subscribe();

    bus.emit(Event::RunStarted { total_units: 3, parallelism: 2 });

    let got_a = tokio::time::timeout(Duration::from_secs(1), sub_a.recv(&bus)).await.unwrap();
    let got_b = tokio::time::timeout(Duration::from_secs(1), sub_b.recv(&bus)).await.unwrap();
    assert!(got_a.is_some());
    assert!(got_b.is_some());

    assert_eq!(bus.dropped_count(), 0);
}

// =============================================================================
// Config loading
// =============================================================================

#[test]
fn config_load_with_explicit_missing_path_errors() {
    let root = tempdir().unwrap();
    let missing = root.path().join("does-not-exist.yml");
    assert!(Config::load(Some(&missing)).is_err());
}

#[test]
fn config_defaults_are_sane() {
    let config = Config::default();
    assert!(config.parallelism > 0);
    assert!(!config.target_branch.is_empty());
}

#[serial]
#[test]
fn config_resolve_github_leaves_explicit_owner_repo_untouched() {
    let repo = tempdir().unwrap();
    init_repo(repo.path());

    let mut config = Config::load(None).unwrap();
    config.github.owner = "explicit-owner".to_string();
    config.github.repo = "explicit-repo".to_string();

    config.resolve_github(repo.path()).expect("resolve_github should not touch explicit values");
    assert_eq!(config.github.owner, "explicit-owner");
    assert_eq!(config.github.repo, "explicit-repo");
}
