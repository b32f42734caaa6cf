//! Job handlers for the evaluation queues.
//!
//! Child handlers decode their payload, run one analyzer and return its
//! result as the job's return value. The aggregation handler runs on the
//! parent once every child has finished and writes the verdict.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::aggregation::aggregate;
use crate::analysis::{ArchitecturalAnalyzer, RationaleAnalyzer, TestingAnalyzer};
use crate::evaluation::{
    ArchitecturalJobData, EvaluationVerdict, FlowJobData, RationaleJobData, TestingJobData,
};
use crate::metrics::MetricsCollector;
use crate::scheduler::{Job, JobError, JobHandler, QueueBackend};
use crate::storage::EvaluationStore;

fn to_return_value<T: Serialize>(analysis: &T) -> Result<serde_json::Value, JobError> {
    serde_json::to_value(analysis)
        .map_err(|e| JobError::Failed(format!("failed to encode analysis: {}", e)))
}

/// Runs the rationale analyzer over the reasoning trace.
pub struct RationaleHandler {
    analyzer: RationaleAnalyzer,
}

impl RationaleHandler {
    pub fn new(analyzer: RationaleAnalyzer) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl JobHandler for RationaleHandler {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value, JobError> {
        let data: RationaleJobData = job.payload()?;
        let analysis = self.analyzer.analyze(&data.steps).await;
        to_return_value(&analysis)
    }
}

/// Runs the architectural analyzer on the blocking pool.
pub struct ArchitecturalHandler {
    analyzer: ArchitecturalAnalyzer,
}

impl ArchitecturalHandler {
    pub fn new(analyzer: ArchitecturalAnalyzer) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl JobHandler for ArchitecturalHandler {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value, JobError> {
        let data: ArchitecturalJobData = job.payload()?;
        let analyzer = self.analyzer.clone();
        let analysis = tokio::task::spawn_blocking(move || analyzer.analyze(&data.source_code))
            .await
            .map_err(|e| JobError::Failed(format!("analysis task panicked: {}", e)))?;
        to_return_value(&analysis)
    }
}

/// Runs the submission's tests in the sandbox.
pub struct TestingHandler {
    analyzer: TestingAnalyzer,
}

impl TestingHandler {
    pub fn new(analyzer: TestingAnalyzer) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl JobHandler for TestingHandler {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value, JobError> {
        let data: TestingJobData = job.payload()?;
        let analysis = self
            .analyzer
            .analyze(&data.source_code, data.test_code.as_deref())
            .await;
        to_return_value(&analysis)
    }
}

/// Aggregates child outcomes into the evaluation's verdict.
pub struct AggregationHandler {
    queue: Arc<dyn QueueBackend>,
    store: Arc<dyn EvaluationStore>,
    metrics: MetricsCollector,
}

impl AggregationHandler {
    pub fn new(queue: Arc<dyn QueueBackend>, store: Arc<dyn EvaluationStore>) -> Self {
        Self {
            queue,
            store,
            metrics: MetricsCollector::new(),
        }
    }
}

#[async_trait]
impl JobHandler for AggregationHandler {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value, JobError> {
        let data: FlowJobData = job.payload()?;
        let outcomes = self
            .queue
            .child_outcomes(job.id)
            .await
            .map_err(|e| JobError::Storage(e.to_string()))?;

        let scores = aggregate(&outcomes);
        let dimensions = [
            ("rationale", &scores.rationale_debt),
            ("architectural", &scores.architectural_coherence_debt),
            ("testing", &scores.testing_verification_debt),
        ]
        .map(|(name, report)| (name, report.failed, report.score));

        let verdict = EvaluationVerdict::from_dimensions(scores);
        let written = self
            .store
            .finalize(data.evaluation_id, &verdict)
            .await
            .map_err(|e| JobError::Storage(e.to_string()))?;

        if written {
            self.metrics.record_evaluation(verdict.status.as_str());
            for (name, failed, score) in dimensions {
                if !failed {
                    self.metrics.record_dimension_score(name, score);
                }
            }
            info!(
                evaluation_id = %data.evaluation_id,
                status = %verdict.status,
                score = verdict.contextual_debt_score,
                "Evaluation finalized"
            );
        } else {
            warn!(
                evaluation_id = %data.evaluation_id,
                "Evaluation was already terminal or missing, verdict discarded"
            );
        }

        Ok(json!({
            "evaluationId": data.evaluation_id,
            "status": verdict.status.as_str(),
            "contextualDebtScore": verdict.contextual_debt_score,
        }))
    }
}
