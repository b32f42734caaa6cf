//! Recording helpers for debt-forge operational metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus series with consistent
//! labels. Every method is a no-op until `init_metrics()` has run, so
//! library code and tests can record freely.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, DIMENSION_SCORE, EVALUATIONS_TOTAL, JOBS_TOTAL, JOB_DURATION, LLM_LATENCY,
    LLM_REQUESTS_TOTAL, SANDBOX_RUNS_TOTAL,
};

/// Status label for a judge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmRequestStatus {
    Success,
    Error,
    Timeout,
}

impl LlmRequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmRequestStatus::Success => "success",
            LlmRequestStatus::Error => "error",
            LlmRequestStatus::Timeout => "timeout",
        }
    }
}

/// Metrics collector for recording debt-forge operational metrics.
///
/// ```ignore
/// use debt_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_job("testing-analysis", "completed", Duration::from_millis(640));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record an evaluation reaching a terminal status.
    pub fn record_evaluation(&self, status: &str) {
        if let Some(total) = EVALUATIONS_TOTAL.get() {
            total.with_label_values(&[status]).inc();
        }
        tracing::trace!(status = status, "Recorded evaluation metric");
    }

    /// Record the score one dimension contributed to an evaluation.
    pub fn record_dimension_score(&self, dimension: &str, score: f64) {
        if let Some(histogram) = DIMENSION_SCORE.get() {
            histogram.with_label_values(&[dimension]).observe(score);
        }
    }

    /// Record a job processed by a worker.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue the job came from
    /// * `status` - "completed", "retried", "failed" or "timeout"
    /// * `duration` - Time spent in the handler
    pub fn record_job(&self, queue: &str, status: &str, duration: Duration) {
        if let Some(total) = JOBS_TOTAL.get() {
            total.with_label_values(&[queue, status]).inc();
        }
        if let Some(histogram) = JOB_DURATION.get() {
            histogram
                .with_label_values(&[queue])
                .observe(duration.as_secs_f64());
        }
        tracing::trace!(
            queue = queue,
            status = status,
            duration_ms = duration.as_millis() as u64,
            "Recorded job metric"
        );
    }

    /// Record a finished sandbox run.
    pub fn record_sandbox_run(&self, outcome: &str) {
        if let Some(total) = SANDBOX_RUNS_TOTAL.get() {
            total.with_label_values(&[outcome]).inc();
        }
    }

    /// Record a judge request and its latency.
    pub fn record_llm_request(&self, model: &str, status: LlmRequestStatus, latency: Duration) {
        if let Some(total) = LLM_REQUESTS_TOTAL.get() {
            total.with_label_values(&[status.as_str()]).inc();
        }
        if let Some(histogram) = LLM_LATENCY.get() {
            histogram
                .with_label_values(&[model])
                .observe(latency.as_secs_f64());
        }
    }

    pub fn worker_started(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn worker_stopped(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }
}
