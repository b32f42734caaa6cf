//! Evaluation orchestrator.
//!
//! Starting an evaluation is synchronous up to the dispatch of the flow:
//! pick a task, persist a running record, ask the agent for a submission,
//! then hand the analyzers a parent/child flow. Everything after that is
//! done by the workers.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::AgentClient;
use crate::evaluation::{
    ArchitecturalJobData, Evaluation, EvaluationStatus, EvaluationVerdict, FlowJobData,
    RationaleJobData, Submission, TaskRequest, TestingJobData, ARCHITECTURAL_QUEUE,
    EVALUATION_FLOW_QUEUE, RATIONALE_QUEUE, TESTING_QUEUE,
};
use crate::metrics::MetricsCollector;
use crate::scheduler::{Flow, Job, QueueBackend, DEFAULT_MAX_ATTEMPTS};
use crate::storage::{EvaluationStore, StoreError, TaskPool};

/// Errors that prevent an evaluation from being created.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The task pool is empty.
    #[error("No tasks available")]
    NoTaskAvailable,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Coordinates task selection, the agent call and flow dispatch.
pub struct EvaluationOrchestrator {
    tasks: Arc<dyn TaskPool>,
    store: Arc<dyn EvaluationStore>,
    agent: Arc<dyn AgentClient>,
    queue: Arc<dyn QueueBackend>,
    job_max_attempts: u32,
    metrics: MetricsCollector,
}

impl EvaluationOrchestrator {
    pub fn new(
        tasks: Arc<dyn TaskPool>,
        store: Arc<dyn EvaluationStore>,
        agent: Arc<dyn AgentClient>,
        queue: Arc<dyn QueueBackend>,
    ) -> Self {
        Self {
            tasks,
            store,
            agent,
            queue,
            job_max_attempts: DEFAULT_MAX_ATTEMPTS,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_job_max_attempts(mut self, attempts: u32) -> Self {
        self.job_max_attempts = attempts.max(1);
        self
    }

    /// Starts an evaluation against the agent at `endpoint`.
    ///
    /// Returns the id of the new record. Agent and dispatch failures do not
    /// surface here: they finalize the record as failed and the id is still
    /// returned so callers can poll for the reason.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::NoTaskAvailable` when the task pool is
    /// empty, in which case no record is created.
    pub async fn start_evaluation(&self, endpoint: &str) -> Result<Uuid, OrchestratorError> {
        let task = self
            .tasks
            .get_all_thoughts()
            .await?
            .into_iter()
            .next()
            .ok_or(OrchestratorError::NoTaskAvailable)?;

        let evaluation = Evaluation::start();
        let evaluation_id = evaluation.id;
        self.store.insert(&evaluation).await?;
        info!(evaluation_id = %evaluation_id, task_id = %task.id, "Evaluation started");

        let request = TaskRequest::from(&task);
        let submission = match self.agent.send_task(endpoint, &request).await {
            Ok(submission) => submission,
            Err(e) => {
                warn!(evaluation_id = %evaluation_id, error = %e, "Agent call failed");
                self.fail(evaluation_id, format!("Agent call failed: {}", e))
                    .await?;
                return Ok(evaluation_id);
            }
        };

        let dispatched = match build_flow(evaluation_id, &submission, self.job_max_attempts) {
            Ok(flow) => self.queue.add_flow(flow).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match dispatched {
            Ok(()) => {
                info!(evaluation_id = %evaluation_id, "Evaluation flow dispatched");
            }
            Err(e) => {
                warn!(evaluation_id = %evaluation_id, error = %e, "Failed to dispatch evaluation flow");
                self.fail(
                    evaluation_id,
                    format!("Failed to enqueue evaluation flow: {}", e),
                )
                .await?;
            }
        }

        Ok(evaluation_id)
    }

    pub async fn get_evaluation(&self, id: Uuid) -> Result<Option<Evaluation>, OrchestratorError> {
        Ok(self.store.get(id).await?)
    }

    async fn fail(&self, id: Uuid, reason: String) -> Result<(), StoreError> {
        if self
            .store
            .finalize(id, &EvaluationVerdict::failure(reason))
            .await?
        {
            self.metrics
                .record_evaluation(EvaluationStatus::Failed.as_str());
        }
        Ok(())
    }
}

/// Builds the parent aggregation job and its three analyzer children.
///
/// Each child carries only the part of the submission its analyzer reads.
pub fn build_flow(
    evaluation_id: Uuid,
    submission: &Submission,
    max_attempts: u32,
) -> Result<Flow, serde_json::Error> {
    let parent = Job::with_payload(EVALUATION_FLOW_QUEUE, &FlowJobData { evaluation_id })?
        .with_max_attempts(max_attempts);

    let rationale = Job::with_payload(RATIONALE_QUEUE, &RationaleJobData::from(submission))?
        .with_max_attempts(max_attempts);
    let architectural =
        Job::with_payload(ARCHITECTURAL_QUEUE, &ArchitecturalJobData::from(submission))?
            .with_max_attempts(max_attempts);
    let testing = Job::with_payload(TESTING_QUEUE, &TestingJobData::from(submission))?
        .with_max_attempts(max_attempts);

    Ok(Flow::new(parent)
        .with_child(rationale)
        .with_child(architectural)
        .with_child(testing))
}
