//! Background job handler trait
//!
//! The task queue runs exactly one registered handler. Handlers are
//! best-effort: a failure is logged and the job is dropped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Name of the metrics submission job
pub const SUBMIT_METRICS_JOB: &str = "submitMetrics";

/// A unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job name; must match the registered handler
    pub name: String,
    /// Job-specific payload
    pub payload: serde_json::Value,
}

impl Job {
    /// Create a job
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Create a metrics submission job
    pub fn submit_metrics(payload: serde_json::Value) -> Self {
        Self::new(SUBMIT_METRICS_JOB, payload)
    }
}

/// Trait for task queue job handlers
///
/// Handlers must not rely on retries: each enqueued job is attempted at most once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one job
    async fn handle(&self, job: Job) -> Result<(), crate::Error>;
}
