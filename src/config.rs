//! Configuration types and loading (spec §6).
//!
//! Precedence (lowest to highest): hard defaults defined here → config file
//! → environment variables → CLI flags. The CLI and env-var layers are
//! applied by `cli.rs` on top of whatever this module loads from disk;
//! `Config::load` only resolves the first two.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, recognized keys per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "target-branch")]
    pub target_branch: String,

    pub parallelism: usize,

    pub github: GithubConfig,

    pub worktree: WorktreeSettings,

    pub provider: ProviderSelection,

    #[serde(rename = "baseline-checks")]
    pub baseline_checks: Vec<BaselineCheck>,

    pub merge: MergeConfig,

    pub review: ReviewPollConfig,

    #[serde(rename = "code-review")]
    pub code_review: CodeReviewConfig,

    #[serde(rename = "log-level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_branch: "main".to_string(),
            parallelism: 4,
            github: GithubConfig::default(),
            worktree: WorktreeSettings::default(),
            provider: ProviderSelection::default(),
            baseline_checks: Vec::new(),
            merge: MergeConfig::default(),
            review: ReviewPollConfig::default(),
            code_review: CodeReviewConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load with fallback chain: explicit path → project-local
    /// `.conductor.yml` → user config dir → hard defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".conductor.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!("Failed to load config from {}: {}", local_config.display(), e),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("conductor").join("conductor.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("Failed to load config from {}: {}", user_config.display(), e),
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Resolve `github.owner`/`github.repo` when either is `"auto"`, by
    /// parsing the `origin` remote URL of `repo_root`.
    pub fn resolve_github(&mut self, repo_root: &Path) -> Result<()> {
        if self.github.owner != "auto" && self.github.repo != "auto" {
            return Ok(());
        }

        let (owner, repo) = detect_origin_owner_repo(repo_root)?;
        if self.github.owner == "auto" {
            self.github.owner = owner;
        }
        if self.github.repo == "auto" {
            self.github.repo = repo;
        }
        Ok(())
    }
}

fn detect_origin_owner_repo(repo_root: &Path) -> Result<(String, String)> {
    let output = std::process::Command::new("git")
        .args(["remote", "get-url", "origin"])
        .current_dir(repo_root)
        .output()
        .context("failed to run git remote get-url origin")?;

    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    parse_owner_repo(&url).context(format!("could not parse owner/repo from remote url {url:?}"))
}

/// Parses `git@github.com:owner/repo.git` and `https://github.com/owner/repo.git`.
fn parse_owner_repo(url: &str) -> Result<(String, String)> {
    let trimmed = url.trim_end_matches(".git");
    // SSH form has exactly one ':' separating host from "owner/repo"; HTTPS
    // form has none, so `owner/repo` is just the last two path segments.
    let path = trimmed.rsplit_once(':').map(|(_, t)| t).unwrap_or(trimmed);
    let mut segments = path.rsplit('/');
    let repo = segments.next().ok_or_else(|| eyre::eyre!("no path in {url:?}"))?;
    let owner = segments.next().ok_or_else(|| eyre::eyre!("no owner segment in {url:?}"))?;
    Ok((owner.to_string(), repo.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub owner: String,
    pub repo: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self { owner: "auto".to_string(), repo: "auto".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeSettings {
    #[serde(rename = "base-path")]
    pub base_path: PathBuf,

    #[serde(default)]
    pub setup: Vec<String>,

    #[serde(default)]
    pub teardown: Vec<String>,
}

impl Default for WorktreeSettings {
    fn default() -> Self {
        Self { base_path: PathBuf::from("/tmp/conductor/worktrees"), setup: Vec::new(), teardown: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSelection {
    #[serde(rename = "type")]
    pub default_id: String,

    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for ProviderSelection {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("claude".to_string(), ProviderConfig { command: "claude".to_string(), args: vec!["-p".to_string()] });
        Self { default_id: "claude".to_string(), providers }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { command: String::new(), args: Vec::new() }
    }
}

/// Same shape as `ProviderConfig`; reviewers are configured under the same
/// `provider.providers` map but selected via `code_review.provider`.
pub type ReviewerConfig = ProviderConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineCheck {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    #[serde(rename = "max-conflict-retries")]
    pub max_conflict_retries: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { max_conflict_retries: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewPollConfig {
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    #[serde(rename = "poll-interval-secs")]
    pub poll_interval_secs: u64,
}

impl Default for ReviewPollConfig {
    fn default() -> Self {
        Self { timeout_secs: 3600, poll_interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeReviewConfig {
    pub enabled: bool,
    pub provider: String,
    #[serde(rename = "max-fix-iterations")]
    pub max_fix_iterations: u32,
    #[serde(default)]
    pub command: Option<String>,
}

impl Default for CodeReviewConfig {
    fn default() -> Self {
        Self { enabled: false, provider: "claude".to_string(), max_fix_iterations: 1, command: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.target_branch, "main");
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.github.owner, "auto");
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
target-branch: develop
parallelism: 8
github:
  owner: acme
  repo: widgets
merge:
  max-conflict-retries: 5
code-review:
  enabled: true
  provider: codex
  max-fix-iterations: 2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.target_branch, "develop");
        assert_eq!(config.parallelism, 8);
        assert_eq!(config.github.owner, "acme");
        assert_eq!(config.merge.max_conflict_retries, 5);
        assert!(config.code_review.enabled);
        assert_eq!(config.code_review.provider, "codex");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = "parallelism: 2\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.target_branch, "main");
        assert_eq!(config.review.poll_interval_secs, 30);
    }

    #[test]
    fn parse_owner_repo_from_ssh_url() {
        let (owner, repo) = parse_owner_repo("git@github.com:acme/widgets.git").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "widgets");
    }

    #[test]
    fn parse_owner_repo_from_https_url() {
        let (owner, repo) = parse_owner_repo("https://github.com/acme/widgets.git").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "widgets");
    }
}
