//! Prompt Loader
//!
//! Loads prompt templates from files or falls back to embedded defaults.

use std::path::{Path, PathBuf};

use eyre::{Result, eyre};
use handlebars::Handlebars;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::reviewer::Issue;

use super::embedded;

/// Loads and renders prompt templates
pub struct PromptLoader {
    hbs: Handlebars<'static>,
    /// User override directory (e.g., `.conductor/prompts/`)
    user_dir: Option<PathBuf>,
    /// Repo default directory (e.g., `prompts/`)
    repo_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// Create a new prompt loader with the given directories
    ///
    /// # Arguments
    /// * `worktree` - The worktree root (used to find `.conductor/prompts/` and `prompts/`)
    pub fn new(worktree: impl AsRef<Path>) -> Self {
        let worktree = worktree.as_ref();
        let user_dir = worktree.join(".conductor/prompts");
        let repo_dir = worktree.join("prompts");

        Self {
            hbs: Handlebars::new(),
            user_dir: if user_dir.exists() { Some(user_dir) } else { None },
            repo_dir: if repo_dir.exists() { Some(repo_dir) } else { None },
        }
    }

    /// Create a loader that only uses embedded prompts (for testing)
    pub fn embedded_only() -> Self {
        Self { hbs: Handlebars::new(), user_dir: None, repo_dir: None }
    }

    /// Load a template by name
    ///
    /// Checks in order:
    /// 1. User override: `.conductor/prompts/{name}.hbs`
    /// 2. Repo default: `prompts/{name}.hbs`
    /// 3. Embedded fallback
    fn load_template(&self, name: &str) -> Result<String> {
        if let Some(ref user_dir) = self.user_dir {
            let path = user_dir.join(format!("{}.hbs", name));
            if path.exists() {
                debug!("Loading prompt from user override: {:?}", path);
                return std::fs::read_to_string(&path).map_err(|e| eyre!("Failed to read user prompt {}: {}", path.display(), e));
            }
        }

        if let Some(ref repo_dir) = self.repo_dir {
            let path = repo_dir.join(format!("{}.hbs", name));
            if path.exists() {
                debug!("Loading prompt from repo: {:?}", path);
                return std::fs::read_to_string(&path).map_err(|e| eyre!("Failed to read repo prompt {}: {}", path.display(), e));
            }
        }

        if let Some(content) = embedded::get_embedded(name) {
            debug!("Using embedded prompt: {}", name);
            return Ok(content.to_string());
        }

        Err(eyre!("Prompt template not found: {}", name))
    }

    fn render(&self, template_name: &str, context: &impl Serialize) -> Result<String> {
        let template = self.load_template(template_name)?;
        self.hbs.render_template(&template, context).map_err(|e| eyre!("Failed to render template {}: {}", template_name, e))
    }

    /// The prompt sent to the provider for one task invocation (spec §4.7 step 2).
    pub fn task_prompt(&self, unit_id: &str, task_number: u32, task_prompt_body: &str, backpressure: &str) -> Result<String> {
        self.render(
            "task",
            &json!({
                "unit_id": unit_id,
                "task_number": task_number,
                "task_prompt": task_prompt_body,
                "backpressure": backpressure,
            }),
        )
    }

    /// The fix-prompt composed from reviewer issues (spec §4.7 step 4).
    pub fn code_review_fix_prompt(&self, base_branch: &str, issues: &[Issue]) -> Result<String> {
        #[derive(Serialize)]
        struct IssueView<'a> {
            file: &'a str,
            line: u32,
            severity: &'static str,
            message: &'a str,
            suggestion: Option<&'a str>,
        }

        let issues: Vec<IssueView> = issues
            .iter()
            .map(|i| IssueView {
                file: &i.file,
                line: i.line,
                severity: match i.severity {
                    crate::reviewer::IssueSeverity::Error => "error",
                    crate::reviewer::IssueSeverity::Warning => "warning",
                    crate::reviewer::IssueSeverity::Suggestion => "suggestion",
                    crate::reviewer::IssueSeverity::Info => "info",
                },
                message: &i.message,
                suggestion: i.suggestion.as_deref(),
            })
            .collect();

        self.render("code-review-fix", &json!({ "base_branch": base_branch, "issues": issues }))
    }

    /// The conflict-resolution prompt (spec §4.7 step 5).
    pub fn merge_conflict_prompt(&self, branch: &str, target_branch: &str, conflicted_paths: &[String]) -> Result<String> {
        self.render("merge-conflict", &json!({ "branch": branch, "target_branch": target_branch, "conflicted_paths": conflicted_paths }))
    }

    /// The re-invocation prompt after a PR receives "changes requested" (spec §4.7 step 6).
    pub fn pr_review_feedback_prompt(&self, unit_id: &str, pr_number: u64, feedback: &str) -> Result<String> {
        self.render("pr-review-feedback", &json!({ "unit_id": unit_id, "pr_number": pr_number, "feedback": feedback }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reviewer::{Issue, IssueSeverity};

    #[test]
    fn task_prompt_renders_embedded_template() {
        let loader = PromptLoader::embedded_only();
        let prompt = loader.task_prompt("unit-a", 1, "Implement the thing", "cargo test").unwrap();
        assert!(prompt.contains("unit-a"));
        assert!(prompt.contains("Implement the thing"));
        assert!(prompt.contains("cargo test"));
    }

    #[test]
    fn code_review_fix_prompt_lists_issues() {
        let loader = PromptLoader::embedded_only();
        let issues = vec![Issue { file: "a.rs".into(), line: 10, severity: IssueSeverity::Error, message: "bug".into(), suggestion: None }];
        let prompt = loader.code_review_fix_prompt("main", &issues).unwrap();
        assert!(prompt.contains("a.rs:10"));
        assert!(prompt.contains("bug"));
    }

    #[test]
    fn merge_conflict_prompt_lists_paths() {
        let loader = PromptLoader::embedded_only();
        let prompt = loader.merge_conflict_prompt("conductor/unit-a-1234", "main", &["src/lib.rs".to_string()]).unwrap();
        assert!(prompt.contains("src/lib.rs"));
        assert!(prompt.contains("main"));
    }

    #[test]
    fn unknown_template_errors() {
        let loader = PromptLoader::embedded_only();
        assert!(loader.load_template("nonexistent-template").is_err());
    }
}
