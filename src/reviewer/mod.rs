//! Reviewer capability (spec §4.2): advisory diff-based code review.
//!
//! A non-zero exit that encodes "issues found" is not a failure — only an
//! inability to run the reviewer at all is. Review failures never block a
//! merge; they only feed the Worker's fix-attempt subloop.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ReviewerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ReviewerError {
    #[error("failed to spawn reviewer: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
    Suggestion,
    Info,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub file: String,
    pub line: u32,
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewResult {
    pub passed: bool,
    pub issues: Vec<Issue>,
    pub summary: String,
    pub raw_output: String,
}

impl ReviewResult {
    pub fn has_blocking_issues(&self) -> bool {
        self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    fn id(&self) -> &str;

    /// Run a diff-based review of `workdir` against `base_branch`. Only
    /// returns `Err` when the reviewer could not be executed at all;
    /// "issues found" is represented in `Ok(ReviewResult)`.
    async fn review(&self, workdir: &Path, base_branch: &str) -> Result<ReviewResult, ReviewerError>;
}

/// Invokes a configured CLI reviewer and parses its stdout for structured
/// issues. Per spec §9, different reviewer CLIs format their output
/// differently (markdown-fenced JSON, bare JSON, or plain prose); parsing
/// degrades to "no structured output" rather than erroring when the output
/// doesn't parse, since the review itself still ran successfully.
pub struct CliReviewer {
    id: String,
    command: String,
    args: Vec<String>,
}

impl CliReviewer {
    pub fn new(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self { id: id.into(), command: command.into(), args }
    }

    pub fn from_config(id: &str, config: &ReviewerConfig) -> Self {
        Self::new(id, config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl Reviewer for CliReviewer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn review(&self, workdir: &Path, base_branch: &str) -> Result<ReviewResult, ReviewerError> {
        debug!(reviewer = %self.id, ?workdir, base_branch, "CliReviewer::review: spawning");

        let output = Command::new(&self.command)
            .args(&self.args)
            .arg(base_branch)
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(ReviewerError::Spawn)?;

        let raw_output = String::from_utf8_lossy(&output.stdout).to_string();
        let issues = parse_issues(&raw_output).unwrap_or_else(|| {
            warn!(reviewer = %self.id, "CliReviewer::review: no structured output, treating as unparsed pass-through");
            Vec::new()
        });

        Ok(ReviewResult { passed: issues.is_empty(), summary: summarize(&issues), issues, raw_output })
    }
}

fn summarize(issues: &[Issue]) -> String {
    if issues.is_empty() {
        "no issues found".to_string()
    } else {
        format!("{} issue(s) found", issues.len())
    }
}

/// Tries, in order: a fenced ```json block, a bare JSON array/object, and
/// finally brace-matching the first top-level `{...}` or `[...]` span.
fn parse_issues(output: &str) -> Option<Vec<Issue>> {
    if let Some(fenced) = extract_fenced_json(output) {
        if let Ok(issues) = serde_json::from_str::<Vec<Issue>>(&fenced) {
            return Some(issues);
        }
    }

    if let Ok(issues) = serde_json::from_str::<Vec<Issue>>(output.trim()) {
        return Some(issues);
    }

    if let Some(span) = brace_match(output) {
        if let Ok(issues) = serde_json::from_str::<Vec<Issue>>(&span) {
            return Some(issues);
        }
    }

    None
}

fn extract_fenced_json(output: &str) -> Option<String> {
    let start = output.find("```json")? + "```json".len();
    let rest = &output[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

fn brace_match(output: &str) -> Option<String> {
    let start = output.find(['[', '{'])?;
    let open = output.as_bytes()[start] as char;
    let close = if open == '[' { ']' } else { '}' };
    let mut depth = 0i32;
    for (i, c) in output[start..].char_indices() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(output[start..start + i + c.len_utf8()].to_string());
            }
        }
    }
    None
}
