//! Worktree manager for creating, rebasing, and cleaning up git worktrees
//! (spec §4.3). Every git write against the shared repo root — worktree add,
//! branch delete, merge, push — goes through `WorktreeManager::git_lock` so
//! that concurrent workers never interleave git commands against the same
//! repository.

use eyre::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error types for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("Rebase conflict in worktree: {0}")]
    RebaseConflict(String),

    #[error("Worktree not found: {0}")]
    NotFound(String),

    #[error("Worktree corrupted: {0}")]
    Corrupted(String),

    #[error("Disk space error: {0}")]
    DiskSpace(String),

    #[error("Git command failed: {0}")]
    GitError(String),
}

/// Configuration for worktree manager
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Base directory for worktrees (default: /tmp/conductor/worktrees)
    pub base_dir: PathBuf,

    /// Path to the main repository
    pub repo_root: PathBuf,

    /// Branch every unit's worktree is created off of, and merged back into.
    pub target_branch: String,

    /// Minimum disk space in GB before refusing to create worktrees
    pub min_disk_space_gb: u64,

    /// Branch prefix for worktree branches
    pub branch_prefix: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        debug!("WorktreeConfig::default: called");
        Self {
            base_dir: PathBuf::from("/tmp/conductor/worktrees"),
            repo_root: PathBuf::from("."),
            target_branch: "main".to_string(),
            min_disk_space_gb: 5,
            branch_prefix: "conductor".to_string(),
        }
    }
}

impl WorktreeConfig {
    /// Create config with specified repo root
    pub fn with_repo(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        debug!(?repo_root, "WorktreeConfig::with_repo: called");
        Self { repo_root, ..Default::default() }
    }
}

/// Information about a created worktree
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    /// Unit id this worktree was created for
    pub unit_id: String,

    /// Nonce distinguishing this attempt from any prior retry of the same
    /// unit, so a stale worktree from a killed attempt never collides with
    /// a fresh one at the same path.
    pub nonce: String,

    /// Path to the worktree
    pub path: PathBuf,

    /// Branch name
    pub branch: String,
}

impl WorktreeInfo {
    fn dir_name(unit_id: &str, nonce: &str) -> String {
        format!("{unit_id}-{nonce}")
    }
}

/// Manager for git worktrees
pub struct WorktreeManager {
    config: WorktreeConfig,
    git_lock: Arc<Mutex<()>>,
}

impl WorktreeManager {
    /// Create a new worktree manager
    pub fn new(config: WorktreeConfig) -> Self {
        debug!(?config, "WorktreeManager::new: called");
        Self { config, git_lock: Arc::new(Mutex::new(())) }
    }

    /// Handle shared by `merge::merge_to_main` to serialize every git write
    /// against `repo_root` across the worker pool.
    pub fn git_lock(&self) -> Arc<Mutex<()>> {
        self.git_lock.clone()
    }

    pub fn config(&self) -> &WorktreeConfig {
        &self.config
    }

    /// Create a new worktree for a unit, branched off `target_branch`.
    pub async fn create(&self, unit_id: &str) -> Result<WorktreeInfo, WorktreeError> {
        debug!(%unit_id, "WorktreeManager::create: called");

        self.ensure_disk_space().await?;

        if let Err(e) = tokio::fs::create_dir_all(&self.config.base_dir).await {
            return Err(WorktreeError::CreateFailed(format!("Failed to create base dir: {}", e)));
        }

        let nonce = Uuid::new_v4().simple().to_string()[..8].to_string();
        let dir_name = WorktreeInfo::dir_name(unit_id, &nonce);
        let worktree_path = self.config.base_dir.join(&dir_name);
        let branch_name = format!("{}/{}", self.config.branch_prefix, dir_name);

        let _guard = self.git_lock.lock().await;
        let output = Command::new("git")
            .args([
                "worktree",
                "add",
                worktree_path.to_str().unwrap(),
                "-b",
                &branch_name,
                &self.config.target_branch,
            ])
            .current_dir(&self.config.repo_root)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        drop(_guard);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::CreateFailed(stderr.to_string()));
        }

        info!("Created worktree at {:?} on branch {}", worktree_path, branch_name);

        Ok(WorktreeInfo { unit_id: unit_id.to_string(), nonce, path: worktree_path, branch: branch_name })
    }

    /// Remove a worktree by its directory name (`<unit_id>-<nonce>`).
    pub async fn remove(&self, dir_name: &str) -> Result<(), WorktreeError> {
        debug!(%dir_name, "WorktreeManager::remove: called");
        let worktree_path = self.config.base_dir.join(dir_name);

        if !worktree_path.exists() {
            warn!("Worktree {:?} does not exist, skipping removal", worktree_path);
            return Ok(());
        }

        let _guard = self.git_lock.lock().await;
        let output = Command::new("git")
            .args(["worktree", "remove", worktree_path.to_str().unwrap(), "--force"])
            .current_dir(&self.config.repo_root)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("is not a working tree") {
                return Err(WorktreeError::RemoveFailed(stderr.to_string()));
            }
        }

        let branch_name = format!("{}/{}", self.config.branch_prefix, dir_name);
        let _ = Command::new("git")
            .args(["branch", "-D", &branch_name])
            .current_dir(&self.config.repo_root)
            .output()
            .await;
        drop(_guard);

        info!("Removed worktree {}", dir_name);
        Ok(())
    }

    /// Rebase a worktree against `target_branch`.
    pub async fn rebase(&self, dir_name: &str) -> Result<(), WorktreeError> {
        debug!(%dir_name, "WorktreeManager::rebase: called");
        let worktree_path = self.config.base_dir.join(dir_name);

        if !worktree_path.exists() {
            return Err(WorktreeError::NotFound(dir_name.to_string()));
        }

        self.auto_commit(&worktree_path, "WIP: before rebase").await?;

        let output = Command::new("git")
            .args(["rebase", &self.config.target_branch])
            .current_dir(&worktree_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            let _ = Command::new("git").args(["rebase", "--abort"]).current_dir(&worktree_path).output().await;
            return Err(WorktreeError::RebaseConflict(dir_name.to_string()));
        }

        info!("Successfully rebased worktree {}", dir_name);
        Ok(())
    }

    /// Auto-commit any uncommitted changes in a worktree
    async fn auto_commit(&self, worktree_path: &Path, message: &str) -> Result<(), WorktreeError> {
        debug!(?worktree_path, %message, "WorktreeManager::auto_commit: called");

        let status_output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(worktree_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if status_output.stdout.is_empty() {
            return Ok(());
        }

        let _ = Command::new("git").args(["add", "-A"]).current_dir(worktree_path).output().await;
        let _ = Command::new("git").args(["commit", "-m", message, "--allow-empty"]).current_dir(worktree_path).output().await;

        Ok(())
    }

    /// Validate a worktree is healthy
    pub async fn validate(&self, dir_name: &str) -> Result<(), WorktreeError> {
        debug!(%dir_name, "WorktreeManager::validate: called");
        let worktree_path = self.config.base_dir.join(dir_name);

        if !worktree_path.exists() {
            return Err(WorktreeError::NotFound(dir_name.to_string()));
        }

        let output = Command::new("git")
            .args(["status"])
            .current_dir(&worktree_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            return Err(WorktreeError::Corrupted(dir_name.to_string()));
        }

        Ok(())
    }

    /// List all worktrees
    pub async fn list(&self) -> Result<Vec<WorktreeInfo>> {
        debug!("WorktreeManager::list: called");
        let mut worktrees = Vec::new();

        if !self.config.base_dir.exists() {
            return Ok(worktrees);
        }

        let mut entries = tokio::fs::read_dir(&self.config.base_dir).await.context("Failed to read worktrees directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                let dir_name = path.file_name().unwrap().to_str().unwrap().to_string();
                let (unit_id, nonce) = dir_name.rsplit_once('-').unwrap_or((dir_name.as_str(), ""));
                let branch_name = format!("{}/{}", self.config.branch_prefix, dir_name);
                worktrees.push(WorktreeInfo {
                    unit_id: unit_id.to_string(),
                    nonce: nonce.to_string(),
                    path,
                    branch: branch_name,
                });
            }
        }

        Ok(worktrees)
    }

    /// Get worktree path for a directory name (`<unit_id>-<nonce>`).
    pub fn worktree_path(&self, dir_name: &str) -> PathBuf {
        self.config.base_dir.join(dir_name)
    }

    /// Check if a worktree exists
    pub fn exists(&self, dir_name: &str) -> bool {
        self.worktree_path(dir_name).exists()
    }

    /// Ensure sufficient disk space before creating worktrees
    async fn ensure_disk_space(&self) -> Result<(), WorktreeError> {
        let available_gb = self.check_disk_space().await?;

        if available_gb < self.config.min_disk_space_gb {
            return Err(WorktreeError::DiskSpace(format!(
                "Only {}GB available, need {}GB minimum",
                available_gb, self.config.min_disk_space_gb
            )));
        }

        Ok(())
    }

    /// Check available disk space in GB
    async fn check_disk_space(&self) -> Result<u64, WorktreeError> {
        let output = Command::new("df")
            .args(["-BG", self.config.base_dir.to_str().unwrap_or("/tmp")])
            .output()
            .await
            .map_err(|e| WorktreeError::DiskSpace(format!("Failed to check disk space: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        for line in stdout.lines().skip(1) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 4 {
                let available = parts[3].trim_end_matches('G');
                if let Ok(gb) = available.parse::<u64>() {
                    return Ok(gb);
                }
            }
        }

        Ok(100)
    }

    /// Clean up orphaned worktrees (directory names not present in `active`)
    pub async fn cleanup_orphaned(&self, active: &[String]) -> Result<usize> {
        debug!(?active, "WorktreeManager::cleanup_orphaned: called");
        let worktrees = self.list().await?;
        let mut cleaned = 0;

        for wt in worktrees {
            let dir_name = WorktreeInfo::dir_name(&wt.unit_id, &wt.nonce);
            if !active.contains(&dir_name) {
                info!("Cleaning up orphaned worktree: {}", dir_name);
                if let Err(e) = self.remove(&dir_name).await {
                    warn!("Failed to remove orphaned worktree {}: {}", dir_name, e);
                } else {
                    cleaned += 1;
                }
            }
        }

        Ok(cleaned)
    }
}
