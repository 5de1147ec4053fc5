//! GitHub PR client (spec §4.7 step 6): create a PR, poll its review state,
//! and merge it once approved.
//!
//! No PR-client precedent exists in the corpus this crate was grounded on;
//! the retry/backoff shape below is adapted from an unrelated crate's
//! exponential-backoff retry policy (see DESIGN.md) rather than reused
//! verbatim, since the source shape is for a generic retry strategy, not
//! specifically HTTP calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    #[error("github API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("github API returned {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("exhausted {0} retries against the github API")]
    RetriesExhausted(u32),
}

#[derive(Debug, Clone)]
pub struct PrHandle {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Pending,
    Approved,
    ChangesRequested,
}

#[async_trait]
pub trait PrClient: Send + Sync {
    async fn create_pr(&self, owner: &str, repo: &str, head: &str, base: &str, title: &str, body: &str) -> Result<PrHandle, GithubError>;

    async fn review_state(&self, owner: &str, repo: &str, number: u64) -> Result<ReviewState, GithubError>;

    async fn merge_pr(&self, owner: &str, repo: &str, number: u64) -> Result<(), GithubError>;
}

/// Backoff shape for transient (5xx / network) failures: exponential with a
/// fixed cap, no jitter (single-process CLI tool, not a fleet of callers
/// that need to avoid a thundering herd).
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_millis(500), max_delay: Duration::from_secs(30) }
    }
}

fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    config.base_delay.saturating_mul(2_u32.saturating_pow(pow)).min(config.max_delay)
}

/// Real GitHub REST API v3 client.
pub struct GithubClient {
    http: Client,
    token: String,
    retry: RetryConfig,
}

impl GithubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self { http: Client::new(), token: token.into(), retry: RetryConfig::default() }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn request_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GithubError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = build()
                .header("Authorization", format!("Bearer {}", self.token))
                .header("User-Agent", "conductor")
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().is_server_error() && attempt < self.retry.max_attempts => {
                    let delay = backoff_delay(&self.retry, attempt);
                    warn!(status = %resp.status(), attempt, ?delay, "github request failed transiently, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(GithubError::Api { status, body });
                }
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = backoff_delay(&self.retry, attempt);
                    warn!(error = %e, attempt, ?delay, "github request errored, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(GithubError::Request(e)),
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatePrBody<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatePrResponse {
    number: u64,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    state: String,
}

#[async_trait]
impl PrClient for GithubClient {
    async fn create_pr(&self, owner: &str, repo: &str, head: &str, base: &str, title: &str, body: &str) -> Result<PrHandle, GithubError> {
        let url = format!("https://api.github.com/repos/{owner}/{repo}/pulls");
        debug!(%url, head, base, "GithubClient::create_pr");

        let payload = CreatePrBody { title, head, base, body };
        let response = self.request_with_retry(|| self.http.post(&url).json(&payload)).await?;
        let created: CreatePrResponse = response.json().await?;

        Ok(PrHandle { number: created.number, url: created.html_url })
    }

    async fn review_state(&self, owner: &str, repo: &str, number: u64) -> Result<ReviewState, GithubError> {
        let url = format!("https://api.github.com/repos/{owner}/{repo}/pulls/{number}/reviews");
        let response = self.request_with_retry(|| self.http.get(&url)).await?;
        let reviews: Vec<ReviewResponse> = response.json().await?;

        // Most recent review wins; GitHub returns reviews in chronological order.
        match reviews.last().map(|r| r.state.as_str()) {
            Some("APPROVED") => Ok(ReviewState::Approved),
            Some("CHANGES_REQUESTED") => Ok(ReviewState::ChangesRequested),
            _ => Ok(ReviewState::Pending),
        }
    }

    async fn merge_pr(&self, owner: &str, repo: &str, number: u64) -> Result<(), GithubError> {
        let url = format!("https://api.github.com/repos/{owner}/{repo}/pulls/{number}/merge");
        self.request_with_retry(|| self.http.put(&url)).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use fake::FakePrClient;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let config = RetryConfig { max_attempts: 10, base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(2) };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn fake_client_tracks_created_and_merged_prs() {
        let client = FakePrClient::new();
        let handle = client.create_pr("acme", "widgets", "unit-a", "main", "Unit A", "body").await.unwrap();
        assert_eq!(handle.number, 1);

        client.set_review_state(handle.number, ReviewState::Approved);
        assert_eq!(client.review_state("acme", "widgets", handle.number).await.unwrap(), ReviewState::Approved);

        client.merge_pr("acme", "widgets", handle.number).await.unwrap();
        assert_eq!(client.merged_prs(), vec![1]);
        assert_eq!(client.created_prs().len(), 1);
    }
}
