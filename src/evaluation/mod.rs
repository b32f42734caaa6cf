//! Evaluation data model.
//!
//! - `record`: the `Evaluation` record and its terminal verdicts
//! - `submission`: what the agent sends back for a task
//! - `report`: per-dimension results and the aggregated report
//! - `payloads`: minimized job payloads for the evaluation flow

pub mod payloads;
pub mod record;
pub mod report;
pub mod submission;

pub use payloads::{
    ArchitecturalJobData, FlowJobData, RationaleJobData, TestingJobData, ALL_QUEUES,
    ARCHITECTURAL_QUEUE, EVALUATION_FLOW_QUEUE, RATIONALE_QUEUE, TESTING_QUEUE,
};
pub use record::{Evaluation, EvaluationStatus, EvaluationVerdict};
pub use report::{
    round_score, ArchitecturalAnalysis, ComplexityMetrics, DebtEvent, DimensionReport,
    DimensionScores, EvaluationReport, RationaleAnalysis, TestingAnalysis,
    SYSTEM_ERROR_CONTEXT_ID,
};
pub use submission::{Action, ContextItem, ReasoningStep, Submission, TaskLike, TaskRequest};
