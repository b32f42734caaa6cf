//! Job definitions for the scheduler.
//!
//! - `Job`: a unit of work on a named queue, optionally owned by a parent
//! - `Flow`: a parent job released only after all of its children finish
//! - `ChildOutcome`: what a finished child left for its parent
//! - `JobError`: how a handler reports failure to its worker

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default maximum number of attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Identifies the parent job a child reports to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub id: Uuid,
    pub queue_name: String,
}

/// A job representing a unit of work.
///
/// The job name always equals its queue name: each analyzer owns exactly
/// one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub queue_name: String,
    /// Handler-specific payload.
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    pub created_at: DateTime<Utc>,
    /// Number of times this job has been attempted.
    #[serde(default)]
    pub attempts: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_attempts: u32,
}

impl Job {
    /// Creates a job on `queue_name` carrying `data`.
    pub fn new(queue_name: impl Into<String>, data: serde_json::Value) -> Self {
        let queue_name = queue_name.into();
        Self {
            id: Uuid::new_v4(),
            name: queue_name.clone(),
            queue_name,
            data,
            parent: None,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Creates a job whose payload is the serialized `payload`.
    pub fn with_payload<T: Serialize>(
        queue_name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(queue_name, serde_json::to_value(payload)?))
    }

    /// Sets the maximum number of attempts. Zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Decodes the payload into the handler's input type.
    ///
    /// # Errors
    ///
    /// Returns `JobError::InvalidPayload`, which is never retried.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| JobError::InvalidPayload(format!("{} payload: {}", self.queue_name, e)))
    }

    /// Increments the attempt counter. Called before each execution attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Returns whether the job may run again after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// A parent job and the children it waits for.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub parent: Job,
    pub children: Vec<Job>,
}

impl Flow {
    pub fn new(parent: Job) -> Self {
        Self {
            parent,
            children: Vec::new(),
        }
    }

    /// Adds a child and points it at the parent.
    pub fn with_child(mut self, mut child: Job) -> Self {
        child.parent = Some(ParentRef {
            id: self.parent.id,
            queue_name: self.parent.queue_name.clone(),
        });
        self.children.push(child);
        self
    }
}

/// Terminal state of a child job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildStatus {
    Completed,
    Failed,
}

/// Record a finished child leaves for its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildOutcome {
    pub job_id: Uuid,
    pub queue_name: String,
    pub status: ChildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ChildOutcome {
    pub fn completed(job: &Job, return_value: serde_json::Value) -> Self {
        Self {
            job_id: job.id,
            queue_name: job.queue_name.clone(),
            status: ChildStatus::Completed,
            return_value: Some(return_value),
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(job: &Job, error: impl Into<String>) -> Self {
        Self {
            job_id: job.id,
            queue_name: job.queue_name.clone(),
            status: ChildStatus::Failed,
            return_value: None,
            error: Some(error.into()),
            finished_at: Utc::now(),
        }
    }
}

/// Status label of a processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Retried,
    Failed,
    Timeout,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Retried => write!(f, "retried"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Errors a job handler can report.
#[derive(Debug, Error)]
pub enum JobError {
    /// The payload does not match the handler's input. Never retried.
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    /// The handler failed; the job may be retried.
    #[error("Job failed: {0}")]
    Failed(String),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    /// A store or queue the handler depends on failed; the job may be retried.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl JobError {
    /// Returns whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::InvalidPayload(_))
    }
}
