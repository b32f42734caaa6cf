//! Queue backend abstraction.
//!
//! Workers, the orchestrator and the CLI talk to queues only through
//! [`QueueBackend`]. [`super::RedisQueue`] is the production backend;
//! [`super::MemoryQueue`] runs the same flow semantics in-process.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::job::{ChildOutcome, Flow, Job, JobError};

/// Seconds a child outcome or job result is retained.
pub const RESULT_TTL_SECS: u64 = 604_800;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Queue depth snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending_jobs: usize,
    pub processing_jobs: usize,
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Jobs currently held by the queue in any list.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.dead_letter_jobs
    }
}

/// A durable, named-queue job store with parent/child flows.
///
/// Flow semantics every backend honours:
/// - children of a flow are visible to workers as soon as `add_flow` returns
/// - the parent is not visible until every child is completed or failed
/// - reporting the same child twice has no further effect
/// - a child dead-lettered after its last attempt counts as finished
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Adds a parent job and its children atomically.
    ///
    /// A flow without children makes its parent visible immediately.
    async fn add_flow(&self, flow: Flow) -> Result<(), QueueError>;

    /// Adds a standalone job.
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;

    /// Takes the next job from `queue`, waiting at most `timeout`.
    ///
    /// The job stays in the queue's processing list until it is completed,
    /// retried or failed.
    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Records a job's return value and reports it to the parent, if any.
    async fn complete(&self, job: &Job, return_value: serde_json::Value) -> Result<(), QueueError>;

    /// Puts a job back on its queue for another attempt.
    async fn retry(&self, job: Job) -> Result<(), QueueError>;

    /// Dead-letters a job and reports the failure to the parent, if any.
    async fn fail(&self, job: &Job, error: &str) -> Result<(), QueueError>;

    /// Returns the recorded outcomes of a parent's children.
    async fn child_outcomes(&self, parent_id: Uuid) -> Result<Vec<ChildOutcome>, QueueError>;

    /// Requeues jobs left in `queue`'s processing list by a crashed worker.
    ///
    /// Returns the number of jobs requeued.
    async fn recover_processing(&self, queue: &str) -> Result<usize, QueueError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;

    /// Returns up to `limit` dead-letter entries without removing them.
    async fn peek_dead_letter(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError>;
}

/// Processes jobs of one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs the job and returns the value recorded as its result.
    async fn handle(&self, job: &Job) -> Result<serde_json::Value, JobError>;
}

/// Builds a dead-letter entry.
pub(crate) fn dead_letter_entry(job: &Job, error: &str) -> serde_json::Value {
    serde_json::json!({
        "job": job,
        "error": error,
        "moved_at": chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            queue_name: "testing-analysis".to_string(),
            pending_jobs: 3,
            processing_jobs: 1,
            dead_letter_jobs: 2,
        };
        assert_eq!(stats.total_jobs(), 6);
    }

    #[test]
    fn test_dead_letter_entry_shape() {
        let job = Job::new("rationale-analysis", serde_json::json!({}));
        let entry = dead_letter_entry(&job, "boom");
        assert_eq!(entry["error"], "boom");
        assert_eq!(entry["job"]["queueName"], "rationale-analysis");
        assert!(entry["moved_at"].is_string());
    }
}
