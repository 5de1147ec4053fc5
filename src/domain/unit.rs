//! The `Unit`: a directory's worth of tasks implementing one design spec.

use serde::{Deserialize, Serialize};

use super::task::Task;

/// Execution status of a `Unit`, as tracked by the scheduler.
///
/// This is distinct from the on-disk frontmatter, which only ever records
/// per-task status; the unit-level status lives in the scheduler's
/// [`UnitState`](super::UnitState) and is never written back to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
    Blocked,
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Blocked)
    }
}

/// A unit of work discovered on disk: one directory, one implementation-plan
/// file, and an ordered set of numbered task files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    /// Unique id, taken verbatim from the implementation-plan frontmatter.
    pub id: String,

    /// Absolute path to the unit's directory.
    pub dir: std::path::PathBuf,

    /// Absolute path to the implementation-plan file that carries the
    /// `unit:`/`depends_on:` frontmatter.
    pub plan_file: std::path::PathBuf,

    /// Other unit ids this unit must wait on.
    pub depends_on: Vec<String>,

    /// Tasks in ascending `number` order.
    pub tasks: Vec<Task>,

    /// Provider id requested in the unit's own frontmatter, if any. Lower
    /// precedence than a CLI force-override but higher than the config file
    /// default (see `config::resolve_provider`).
    pub provider: Option<String>,
}

impl Unit {
    /// True once every task's on-disk status is `complete`.
    pub fn all_tasks_complete(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == super::task::TaskStatus::Complete)
    }

    /// The next task to run: lowest-numbered task that isn't complete and
    /// whose intra-unit dependencies are all complete.
    pub fn next_task(&self) -> Option<&Task> {
        let complete_numbers: Vec<u32> = self
            .tasks
            .iter()
            .filter(|t| t.status == super::task::TaskStatus::Complete)
            .map(|t| t.number)
            .collect();

        self.tasks
            .iter()
            .filter(|t| t.status != super::task::TaskStatus::Complete)
            .filter(|t| t.depends_on.iter().all(|d| complete_numbers.contains(d)))
            .min_by_key(|t| t.number)
    }
}
