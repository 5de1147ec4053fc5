//! CLI command definitions and subcommands (spec §6).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "conductor",
    about = "Parallel development orchestrator: drives dependency-ordered units of work through isolated git worktrees to reviewed, merged pull requests",
    version,
    after_help = "Logs are written to stderr; set RUST_LOG or --verbose to adjust verbosity."
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Discover units under `tasks_dir` and drive them to completion
    Run {
        /// Directory containing one subdirectory per unit
        #[arg(default_value = "tasks")]
        tasks_dir: PathBuf,

        /// Print the discovered schedule without executing anything
        #[arg(long)]
        dry_run: bool,

        /// Restrict the run to a single unit id
        #[arg(long)]
        unit: Option<String>,

        /// Override the configured parallelism
        #[arg(long)]
        parallelism: Option<usize>,

        /// Override the configured target branch
        #[arg(long = "target-branch")]
        target_branch: Option<String>,

        /// Skip pull request creation entirely
        #[arg(long)]
        no_pr: bool,

        /// Skip advisory code review even if configured
        #[arg(long)]
        skip_review: bool,

        /// Default provider id for units that don't pin their own
        #[arg(long)]
        provider: Option<String>,

        /// Force every unit onto this provider id, overriding frontmatter
        #[arg(long = "force-task-provider")]
        force_task_provider: Option<String>,

        /// Disable interactive output; emit JSON event lines on stdout instead
        #[arg(long)]
        no_tui: bool,
    },

    /// Print a read-only snapshot of unit/task status from frontmatter
    Status {
        #[arg(default_value = "tasks")]
        tasks_dir: PathBuf,
    },

    /// Print the prompt that would be sent for a unit's next task
    Prompt {
        /// Unit id to inspect
        unit: String,

        #[arg(default_value = "tasks")]
        tasks_dir: PathBuf,
    },

    /// Remove worktrees left behind by a prior run
    Cleanup {
        /// Base directory worktrees are created under
        #[arg(long)]
        worktree_base: Option<PathBuf>,
    },
}
