//! conductor - parallel development orchestrator
//!
//! Discovers units of work annotated with YAML frontmatter, builds a
//! dependency DAG, and drives each unit through an isolated git worktree to
//! a merged, reviewed pull request, running independent units concurrently
//! under a bounded worker pool.
//!
//! # Modules
//!
//! - [`discovery`] - walks a tasks directory into `Unit`s
//! - [`scheduler`] - owns the dependency DAG and dispatch decisions
//! - [`worktree`] - git worktree lifecycle and merge-back
//! - [`provider`] / [`reviewer`] - LLM CLI capabilities
//! - [`github`] - PR creation, review polling, merge
//! - [`worker`] - drives one unit through its full lifecycle
//! - [`pool`] - bounded concurrent worker execution
//! - [`orchestrator`] - the dispatch loop
//! - [`escalator`] - surfaces failures needing human attention
//! - [`events`] - the pub/sub activity stream
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod escalator;
pub mod events;
pub mod frontmatter;
pub mod github;
pub mod orchestrator;
pub mod pool;
pub mod prompts;
pub mod provider;
pub mod reviewer;
pub mod scheduler;
pub mod worker;
pub mod worktree;

// Re-export commonly used types
pub use config::Config;
pub use discovery::{DiscoveryError, discover};
pub use domain::{Task, TaskStatus, Unit, UnitState, UnitStatus};
pub use escalator::{Escalation, EscalationSink, Escalator, EscalatorError, MultiSink, TerminalSink, WebhookSink};
pub use events::{Event, EventBus, EventEnvelope, EventSubscriber, Severity, create_event_bus};
pub use github::{GithubClient, GithubError, PrClient, PrHandle, ReviewState};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome};
pub use pool::{Pool, PoolError, ProviderFactory};
pub use provider::{CliProvider, OutputLine, Provider, ProviderError, resolve_provider_id};
pub use prompts::PromptLoader;
pub use reviewer::{CliReviewer, Issue, IssueSeverity, Reviewer, ReviewerError, ReviewResult};
pub use scheduler::{DispatchResult, ScheduleError, Scheduler};
pub use worker::{Worker, WorkerConfig, WorkerError};
pub use worktree::{MergeResult, WorktreeConfig, WorktreeError, WorktreeInfo, WorktreeManager, merge_to_main};
