//! Provider capability (spec §4.2): spawns an external LLM-CLI process and
//! streams its output to completion. Opaque to the orchestrator beyond exit
//! status and streamed text — the provider binary is free to be `claude`,
//! `codex`, or any other CLI agent invoked with a prompt on stdin.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider exited non-zero (code {code:?}): {stderr_tail}")]
    NonZeroExit { code: Option<i32>, stderr_tail: String },

    #[error("provider invocation cancelled")]
    ContextCancelled,

    #[error("provider invocation exceeded its {0:?} timeout")]
    Timeout(Duration),

    #[error("failed to spawn provider: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A line of streamed provider output, tagged by which stream it came from.
/// The Worker tees these into the event bus unless TUI output-suppression is
/// configured.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Something that can carry out a task's prompt against an LLM CLI.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable id used in config/frontmatter provider selection (`claude`,
    /// `codex`, `mock`, ...).
    fn id(&self) -> &str;

    /// Run `prompt` in `workdir`, streaming output lines to `sink` as they
    /// arrive. Returns once the process exits, is killed by `cancel`, or the
    /// `timeout` elapses.
    async fn invoke(
        &self,
        prompt: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: CancellationToken,
        sink: &(dyn Fn(OutputLine) + Send + Sync),
    ) -> Result<(), ProviderError>;
}

/// Invokes a configured CLI binary, feeding `prompt` on stdin.
pub struct CliProvider {
    id: String,
    command: String,
    args: Vec<String>,
}

impl CliProvider {
    pub fn new(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self { id: id.into(), command: command.into(), args }
    }

    pub fn from_config(id: &str, config: &ProviderConfig) -> Self {
        Self::new(id, config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        prompt: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: CancellationToken,
        sink: &(dyn Fn(OutputLine) + Send + Sync),
    ) -> Result<(), ProviderError> {
        debug!(provider = %self.id, ?workdir, "CliProvider::invoke: spawning");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ProviderError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(prompt.as_bytes()).await;
            drop(stdin);
        }

        let mut stdout_lines = BufReader::new(child.stdout.take().expect("piped stdout")).lines();
        let mut stderr_lines = BufReader::new(child.stderr.take().expect("piped stderr")).lines();
        let mut stderr_tail = String::new();

        let run = async {
            loop {
                tokio::select! {
                    line = stdout_lines.next_line() => {
                        match line {
                            Ok(Some(l)) => sink(OutputLine::Stdout(l)),
                            Ok(None) => {}
                            Err(_) => {}
                        }
                    }
                    line = stderr_lines.next_line() => {
                        match line {
                            Ok(Some(l)) => {
                                stderr_tail.push_str(&l);
                                stderr_tail.push('\n');
                                sink(OutputLine::Stderr(l));
                            }
                            Ok(None) => {}
                            Err(_) => {}
                        }
                    }
                    status = child.wait() => {
                        return status;
                    }
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(provider = %self.id, "CliProvider::invoke: cancelled, killing child");
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(ProviderError::ContextCancelled)
            }
            result = tokio::time::timeout(timeout, run) => {
                match result {
                    Err(_elapsed) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        Err(ProviderError::Timeout(timeout))
                    }
                    Ok(Err(io_err)) => Err(ProviderError::Spawn(io_err)),
                    Ok(Ok(status)) if status.success() => Ok(()),
                    Ok(Ok(status)) => {
                        let tail: String = stderr_tail.lines().rev().take(20).collect::<Vec<_>>().join("\n");
                        Err(ProviderError::NonZeroExit { code: status.code(), stderr_tail: tail })
                    }
                }
            }
        }
    }
}

/// Resolve the precedence chain from spec §4.2: force-override flag →
/// per-unit frontmatter → CLI default flag → environment variable → config
/// file → hard default ("claude" unless configured otherwise).
pub fn resolve_provider_id(
    force_override: Option<&str>,
    unit_frontmatter: Option<&str>,
    cli_default: Option<&str>,
    env_default: Option<&str>,
    config_default: &str,
) -> String {
    force_override
        .or(unit_frontmatter)
        .or(cli_default)
        .or(env_default)
        .unwrap_or(config_default)
        .to_string()
}
