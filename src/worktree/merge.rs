//! Merges a completed unit's worktree branch back into the target branch
//! (spec §4.3). Callers are expected to hold `WorktreeManager::git_lock` for
//! the duration of the call, since this mutates the shared repo root's
//! working tree (checkout, merge, push) and must never interleave with
//! another unit's merge.

use std::path::Path;

use eyre::{Result, bail};
use tokio::process::Command;
use tracing::{info, warn};

/// Result of a merge operation
#[derive(Debug, Clone)]
pub enum MergeResult {
    /// Merge succeeded
    Success,
    /// Merge had conflicts that need resolution
    Conflict { message: String, conflicted_paths: Vec<String> },
    /// Push to remote failed
    PushFailed { message: String },
}

impl MergeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::Conflict { message, .. } => Some(message),
            Self::PushFailed { message } => Some(message),
        }
    }
}

/// Merge a completed unit's worktree branch into `target_branch`.
///
/// 1. Auto-commits any uncommitted changes in the worktree
/// 2. Checks out `target_branch` in the repo root
/// 3. Pulls latest `target_branch`
/// 4. Merges the feature branch with `--no-ff`
/// 5. Pushes to remote
pub async fn merge_to_main(
    repo_root: &Path,
    worktree_path: &Path,
    branch_name: &str,
    target_branch: &str,
    unit_title: &str,
) -> Result<MergeResult> {
    info!(branch = %branch_name, target = %target_branch, unit = %unit_title, "Starting merge");

    let status = Command::new("git").args(["status", "--porcelain"]).current_dir(worktree_path).output().await?;

    if !status.stdout.is_empty() {
        info!("Auto-committing uncommitted changes in worktree");

        Command::new("git").args(["add", "-A"]).current_dir(worktree_path).output().await?;

        let commit_msg = format!("WIP: Auto-commit before merge for {}", unit_title);
        let commit_output = Command::new("git").args(["commit", "-m", &commit_msg]).current_dir(worktree_path).output().await?;

        if !commit_output.status.success() {
            let stderr = String::from_utf8_lossy(&commit_output.stderr);
            warn!("Auto-commit failed: {}", stderr);
        }
    }

    let checkout_output = Command::new("git").args(["checkout", target_branch]).current_dir(repo_root).output().await?;

    if !checkout_output.status.success() {
        let stderr = String::from_utf8_lossy(&checkout_output.stderr);
        bail!("Failed to checkout {}: {}", target_branch, stderr);
    }

    let pull_output = Command::new("git").args(["pull", "--rebase"]).current_dir(repo_root).output().await?;

    if !pull_output.status.success() {
        let stderr = String::from_utf8_lossy(&pull_output.stderr);
        warn!("Pull failed (might be no remote): {}", stderr);
    }

    let merge_msg = format!("Merge unit: {}", unit_title);
    let merge_output =
        Command::new("git").args(["merge", "--no-ff", branch_name, "-m", &merge_msg]).current_dir(repo_root).output().await?;

    if !merge_output.status.success() {
        let stderr = String::from_utf8_lossy(&merge_output.stderr);
        if stderr.contains("CONFLICT") {
            warn!("Merge conflict detected for {}", branch_name);
            let conflicted_paths = list_conflicted_paths(repo_root).await.unwrap_or_default();
            return Ok(MergeResult::Conflict { message: stderr.to_string(), conflicted_paths });
        }
        bail!("Merge failed: {}", stderr);
    }

    info!(branch = %branch_name, "Merge completed, pushing to remote");

    let push_output = Command::new("git").args(["push", "origin", target_branch]).current_dir(repo_root).output().await?;

    if !push_output.status.success() {
        let stderr = String::from_utf8_lossy(&push_output.stderr);
        warn!("Push failed: {}", stderr);
        return Ok(MergeResult::PushFailed { message: stderr.to_string() });
    }

    info!(branch = %branch_name, target = %target_branch, "Successfully merged and pushed");

    Ok(MergeResult::Success)
}

async fn list_conflicted_paths(repo_root: &Path) -> Result<Vec<String>> {
    let output = Command::new("git").args(["diff", "--name-only", "--diff-filter=U"]).current_dir(repo_root).output().await?;
    Ok(String::from_utf8_lossy(&output.stdout).lines().map(|s| s.to_string()).collect())
}
