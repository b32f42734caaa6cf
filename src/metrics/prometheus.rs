//! Prometheus metrics registration and export.
//!
//! Defines every series debt-forge records and the functions that
//! initialize, register and export them.

use prometheus::{CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all debt-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Evaluations reaching a terminal state, labeled by status.
pub static EVALUATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Distribution of per-dimension scores, labeled by dimension.
pub static DIMENSION_SCORE: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs processed by worker pools, labeled by queue and status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job handling duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Sandbox runs, labeled by outcome.
pub static SANDBOX_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Judge requests, labeled by status.
pub static LLM_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Judge request latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Number of workers currently running.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling it again is harmless: the first
/// registry stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric cannot be created or registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let evaluations_total = CounterVec::new(
        Opts::new(
            "debt_forge_evaluations_total",
            "Evaluations reaching a terminal state",
        ),
        &["status"],
    )?;

    let dimension_score = HistogramVec::new(
        HistogramOpts::new("debt_forge_dimension_score", "Distribution of dimension scores")
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
        &["dimension"],
    )?;

    let jobs_total = CounterVec::new(
        Opts::new("debt_forge_jobs_total", "Jobs processed by worker pools"),
        &["queue", "status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new("debt_forge_job_duration_seconds", "Job handling duration in seconds")
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["queue"],
    )?;

    let sandbox_runs_total = CounterVec::new(
        Opts::new("debt_forge_sandbox_runs_total", "Sandbox runs by outcome"),
        &["outcome"],
    )?;

    let llm_requests_total = CounterVec::new(
        Opts::new("debt_forge_llm_requests_total", "Judge requests by status"),
        &["status"],
    )?;

    let llm_latency = HistogramVec::new(
        HistogramOpts::new("debt_forge_llm_latency_seconds", "Judge request latency in seconds")
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["model"],
    )?;

    let active_workers = Gauge::new("debt_forge_active_workers", "Number of active workers")?;

    registry.register(Box::new(evaluations_total.clone()))?;
    registry.register(Box::new(dimension_score.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(sandbox_runs_total.clone()))?;
    registry.register(Box::new(llm_requests_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Already-set cells mean a previous call won; keep its instances.
    let _ = REGISTRY.set(registry);
    let _ = EVALUATIONS_TOTAL.set(evaluations_total);
    let _ = DIMENSION_SCORE.set(dimension_score);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = SANDBOX_RUNS_TOTAL.set(sandbox_runs_total);
    let _ = LLM_REQUESTS_TOTAL.set(llm_requests_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not
/// been initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Axum handler for `GET /metrics`.
pub async fn metrics_handler() -> String {
    export_metrics()
}
