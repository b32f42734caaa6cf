//! Metrics module for Prometheus-based monitoring.
//!
//! Records evaluation outcomes, dimension scores, job throughput, sandbox
//! outcomes and judge requests.
//!
//! ```ignore
//! use debt_forge::metrics::{export_metrics, init_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_evaluation("complete");
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{LlmRequestStatus, MetricsCollector};
pub use prometheus::{
    export_metrics, init_metrics, metrics_handler, ACTIVE_WORKERS, DIMENSION_SCORE,
    EVALUATIONS_TOTAL, JOBS_TOTAL, JOB_DURATION, LLM_LATENCY, LLM_REQUESTS_TOTAL, REGISTRY,
    SANDBOX_RUNS_TOTAL,
};
