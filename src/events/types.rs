//! Event vocabulary for the orchestrator's activity stream.
//!
//! Every significant state transition in the system is represented here.
//! Events are immutable and carry enough structure to be rendered as JSON
//! lines for an external consumer (`--no-tui` / the event-stream contract
//! in the external interfaces), without that consumer needing to be
//! implemented by this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity used by the escalator to pick a notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Blocking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // === Orchestration lifecycle ===
    RunStarted { total_units: usize, parallelism: usize },
    RunBlocked { complete: usize, failed: usize, blocked: usize },
    RunComplete { total_units: usize },
    RunCancelled,

    // === Unit lifecycle ===
    UnitDispatched { unit_id: String },
    UnitCompleted { unit_id: String },
    UnitFailed { unit_id: String, error: String },
    UnitBlocked { unit_id: String, upstream_failure: String },

    // === Worktree ===
    WorktreeCreated { unit_id: String, path: String, branch: String },
    WorktreeRemoved { unit_id: String },

    // === Task phase ===
    TaskStarted { unit_id: String, task_number: u32 },
    TaskProviderInvoked { unit_id: String, task_number: u32, attempt: u32 },
    TaskProviderOutput { unit_id: String, task_number: u32, line: String, is_stderr: bool },
    TaskBackpressureRun { unit_id: String, task_number: u32, command: String },
    TaskCompleted { unit_id: String, task_number: u32 },
    TaskFailed { unit_id: String, task_number: u32, error: String },

    // === Baseline ===
    BaselineStarted { unit_id: String, name: String },
    BaselineFailed { unit_id: String, name: String, output: String },
    BaselinePassed { unit_id: String },

    // === Code review (advisory) ===
    CodeReviewStarted { unit_id: String },
    CodeReviewIssuesFound { unit_id: String, issue_count: usize },
    CodeReviewFailed { unit_id: String, error: String },
    CodeReviewPassed { unit_id: String },

    // === Merge ===
    MergeConflict { unit_id: String, conflicted_paths: Vec<String> },
    MergeCompleted { unit_id: String },

    // === PR lifecycle ===
    PrCreated { unit_id: String, number: u64, url: String },
    PrReviewStateChanged { unit_id: String, number: u64, state: String },
    PrMerged { unit_id: String, number: u64 },
    PrReviewTimeout { unit_id: String, number: u64 },
    FeaturePrCreated { number: u64, url: String, unit_ids: Vec<String> },

    // === Escalation ===
    Escalated { unit_id: String, severity: Severity, message: String },
}

impl Event {
    /// The unit this event concerns, if any (orchestration-wide events have none).
    pub fn unit_id(&self) -> Option<&str> {
        match self {
            Event::RunStarted { .. }
            | Event::RunBlocked { .. }
            | Event::RunComplete { .. }
            | Event::RunCancelled
            | Event::FeaturePrCreated { .. } => None,
            Event::UnitDispatched { unit_id }
            | Event::UnitCompleted { unit_id }
            | Event::UnitFailed { unit_id, .. }
            | Event::UnitBlocked { unit_id, .. }
            | Event::WorktreeCreated { unit_id, .. }
            | Event::WorktreeRemoved { unit_id }
            | Event::TaskStarted { unit_id, .. }
            | Event::TaskProviderInvoked { unit_id, .. }
            | Event::TaskProviderOutput { unit_id, .. }
            | Event::TaskBackpressureRun { unit_id, .. }
            | Event::TaskCompleted { unit_id, .. }
            | Event::TaskFailed { unit_id, .. }
            | Event::BaselineStarted { unit_id, .. }
            | Event::BaselineFailed { unit_id, .. }
            | Event::BaselinePassed { unit_id }
            | Event::CodeReviewStarted { unit_id }
            | Event::CodeReviewIssuesFound { unit_id, .. }
            | Event::CodeReviewFailed { unit_id, .. }
            | Event::CodeReviewPassed { unit_id }
            | Event::MergeConflict { unit_id, .. }
            | Event::MergeCompleted { unit_id }
            | Event::PrCreated { unit_id, .. }
            | Event::PrReviewStateChanged { unit_id, .. }
            | Event::PrMerged { unit_id, .. }
            | Event::PrReviewTimeout { unit_id, .. }
            | Event::Escalated { unit_id, .. } => Some(unit_id),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "RunStarted",
            Event::RunBlocked { .. } => "RunBlocked",
            Event::RunComplete { .. } => "RunComplete",
            Event::RunCancelled => "RunCancelled",
            Event::UnitDispatched { .. } => "UnitDispatched",
            Event::UnitCompleted { .. } => "UnitCompleted",
            Event::UnitFailed { .. } => "UnitFailed",
            Event::UnitBlocked { .. } => "UnitBlocked",
            Event::WorktreeCreated { .. } => "WorktreeCreated",
            Event::WorktreeRemoved { .. } => "WorktreeRemoved",
            Event::TaskStarted { .. } => "TaskStarted",
            Event::TaskProviderInvoked { .. } => "TaskProviderInvoked",
            Event::TaskProviderOutput { .. } => "TaskProviderOutput",
            Event::TaskBackpressureRun { .. } => "TaskBackpressureRun",
            Event::TaskCompleted { .. } => "TaskCompleted",
            Event::TaskFailed { .. } => "TaskFailed",
            Event::BaselineStarted { .. } => "BaselineStarted",
            Event::BaselineFailed { .. } => "BaselineFailed",
            Event::BaselinePassed { .. } => "BaselinePassed",
            Event::CodeReviewStarted { .. } => "CodeReviewStarted",
            Event::CodeReviewIssuesFound { .. } => "CodeReviewIssuesFound",
            Event::CodeReviewFailed { .. } => "CodeReviewFailed",
            Event::CodeReviewPassed { .. } => "CodeReviewPassed",
            Event::MergeConflict { .. } => "MergeConflict",
            Event::MergeCompleted { .. } => "MergeCompleted",
            Event::PrCreated { .. } => "PrCreated",
            Event::PrReviewStateChanged { .. } => "PrReviewStateChanged",
            Event::PrMerged { .. } => "PrMerged",
            Event::PrReviewTimeout { .. } => "PrReviewTimeout",
            Event::FeaturePrCreated { .. } => "FeaturePrCreated",
            Event::Escalated { .. } => "Escalated",
        }
    }
}

/// A timestamped envelope, the unit that's actually sent over the wire for
/// JSON-lines consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event) -> Self {
        Self { timestamp: Utc::now(), event }
    }
}
