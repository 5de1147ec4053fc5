//! Escalator (spec §4.10): surfaces failures that need a human's attention.
//!
//! Delivery is fire-and-forget from the caller's perspective: `escalate`
//! spawns a bounded task against a fixed-capacity semaphore and returns
//! immediately. When the semaphore is saturated the escalation is dropped
//! (counted), never queued — a storm of failing units must not spawn
//! unbounded async work.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::events::Severity;

#[derive(Debug, thiserror::Error)]
pub enum EscalatorError {
    #[error("webhook delivery failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct Escalation {
    pub unit_id: String,
    pub severity: Severity,
    pub message: String,
}

/// Severity inference by keyword matching on the error message (spec
/// §4.10). Checked in the order given since "merge conflict" is a kind of
/// failure that could also mention a baseline command in its output.
pub fn infer_severity(message: &str) -> Severity {
    let lower = message.to_lowercase();
    if lower.contains("merge conflict") {
        Severity::Blocking
    } else if lower.contains("review timeout") {
        Severity::Warning
    } else if lower.contains("baseline") {
        Severity::Critical
    } else {
        Severity::Critical
    }
}

#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn escalate(&self, escalation: &Escalation) -> Result<(), EscalatorError>;
}

/// Writes to stderr with a severity glyph.
pub struct TerminalSink;

#[async_trait]
impl EscalationSink for TerminalSink {
    async fn escalate(&self, escalation: &Escalation) -> Result<(), EscalatorError> {
        let glyph = match escalation.severity {
            Severity::Info => "i",
            Severity::Warning => "!",
            Severity::Critical => "x",
            Severity::Blocking => "!!",
        };
        eprintln!("[{glyph}] {}: {}", escalation.unit_id, escalation.message);
        Ok(())
    }
}

/// POSTs a JSON body to a configured webhook URL.
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), url: url.into() }
    }
}

#[async_trait]
impl EscalationSink for WebhookSink {
    async fn escalate(&self, escalation: &Escalation) -> Result<(), EscalatorError> {
        self.http
            .post(&self.url)
            .json(&json!({
                "unit_id": escalation.unit_id,
                "severity": escalation.severity,
                "message": escalation.message,
            }))
            .send()
            .await?;
        Ok(())
    }
}

/// Fans out to several sinks, reporting the first error (if any) but
/// always attempting every sink.
pub struct MultiSink {
    sinks: Vec<Arc<dyn EscalationSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn EscalationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EscalationSink for MultiSink {
    async fn escalate(&self, escalation: &Escalation) -> Result<(), EscalatorError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.escalate(escalation).await {
                warn!(error = %e, "escalator: sink failed, continuing with remaining sinks");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Bounded dispatcher: one `Escalator` per run, shared by the orchestrator.
pub struct Escalator {
    sink: Arc<dyn EscalationSink>,
    semaphore: Arc<Semaphore>,
    capacity: u32,
    dropped: AtomicU64,
}

impl Escalator {
    pub fn new(sink: Arc<dyn EscalationSink>, capacity: usize) -> Self {
        Self { sink, semaphore: Arc::new(Semaphore::new(capacity)), capacity: capacity as u32, dropped: AtomicU64::new(0) }
    }

    /// Non-blocking. Drops (and counts) the escalation if the semaphore is
    /// already saturated instead of queuing it.
    pub fn escalate(&self, unit_id: String, message: String) {
        let severity = infer_severity(&message);
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%unit_id, "escalator: at capacity, dropping escalation");
                return;
            }
        };

        let sink = self.sink.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let escalation = Escalation { unit_id, severity, message };
            if let Err(e) = sink.escalate(&escalation).await {
                warn!(error = %e, "escalator: delivery failed");
            }
        });
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Waits (bounded by `timeout`) for every in-flight escalation to
    /// finish, so graceful shutdown never orphans one.
    pub async fn flush(&self, timeout: Duration) {
        let semaphore = self.semaphore.clone();
        let capacity = self.capacity;
        let _ = tokio::time::timeout(timeout, async move {
            let _ = semaphore.acquire_many(capacity).await;
        })
        .await;
    }
}
