//! The `Task`: an atomic, backpressure-gated piece of work within a `Unit`.

use serde::{Deserialize, Serialize};

/// Status of a task, as recorded in its frontmatter on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One atomic sub-goal within a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Ordering & tie-break key within the unit.
    pub number: u32,

    /// Path to the task's own markdown file, needed by the Worker to
    /// rewrite its `status` frontmatter key after a provider invocation.
    pub path: std::path::PathBuf,

    /// Free-form markdown body of the task file, sent to the provider as-is.
    pub prompt: String,

    /// Shell command whose zero exit gates acceptance of the task.
    pub backpressure: String,

    /// Task numbers (within the same unit) that must be complete first.
    pub depends_on: Vec<u32>,

    /// Current status, mirrored from the task file's frontmatter.
    pub status: TaskStatus,
}
