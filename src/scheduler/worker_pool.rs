//! Worker pool for processing jobs of one queue.
//!
//! Each worker runs as an independent async task, pulls jobs from the
//! shared backend and hands them to the queue's [`JobHandler`].
//!
//! # Job lifecycle
//!
//! - handler returns a value: the job is completed and its parent notified
//! - retryable error with attempts left: the job is requeued
//! - anything else: the job is dead-lettered and its parent notified

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsCollector;

use super::backend::{JobHandler, QueueBackend, QueueError};
use super::job::{Job, JobError, JobStatus};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Queue the workers consume.
    pub queue_name: String,
    /// How long one dequeue waits for a job.
    pub poll_interval: Duration,
    /// Maximum time allowed for processing a single job.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_name: "evaluation-flow".to_string(),
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with the given number of workers. Zero is
    /// treated as one.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            ..Default::default()
        }
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently processing a job.
    pub active_workers: usize,
    pub jobs_completed: u64,
    /// Failed attempts, including ones that were retried.
    pub jobs_failed: u64,
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the number of attempts processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// Pool of workers consuming one queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn QueueBackend>,
    handler: Arc<dyn JobHandler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn QueueBackend>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        // Only one shutdown signal is ever sent.
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Recovers abandoned jobs and spawns the workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        match self.queue.recover_processing(&self.config.queue_name).await {
            Ok(recovered) if recovered > 0 => {
                info!(
                    queue = %self.config.queue_name,
                    recovered = recovered,
                    "Recovered jobs from processing queue"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(queue = %self.config.queue_name, error = %e, "Failed to recover processing jobs");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("{}-worker-{}", self.config.queue_name, i),
                queue_name: self.config.queue_name.clone(),
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                job_timeout: self.config.job_timeout,
                stats: Arc::clone(&self.stats),
                metrics: self.metrics.clone(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            queue = %self.config.queue_name,
            backend = self.queue.name(),
            num_workers = self.config.num_workers,
            "Worker pool started"
        );

        Ok(())
    }

    /// Signals every worker and waits for in-flight jobs to finish.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(queue = %self.config.queue_name, "Initiating worker pool shutdown");

        // Workers that already stopped have dropped their receivers.
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!(queue = %self.config.queue_name, "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }
}

/// A single worker task.
struct Worker {
    id: String,
    queue_name: String,
    queue: Arc<dyn QueueBackend>,
    handler: Arc<dyn JobHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    job_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Polls for jobs until the shutdown signal arrives.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");
        self.metrics.worker_started();

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(&self.queue_name, self.poll_interval).await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => debug!(worker_id = %self.id, "No jobs available"),
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        self.metrics.worker_stopped();
        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_job(&self, mut job: Job) {
        let job_id = job.id;
        let start_time = Instant::now();

        job.increment_attempts();
        info!(
            worker_id = %self.id,
            job_id = %job_id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        self.stats.increment_active();
        let result = match tokio::time::timeout(self.job_timeout, self.handler.handle(&job)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout(self.job_timeout)),
        };
        let duration = start_time.elapsed();
        self.stats.decrement_active();

        let status = match result {
            Ok(value) => {
                self.stats.record_completion(duration);
                if let Err(e) = self.queue.complete(&job, value).await {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to mark job complete");
                }
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
                JobStatus::Completed
            }
            Err(e) if e.is_retryable() && job.should_retry() => {
                self.stats.record_failure(duration);
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    remaining_attempts = job.remaining_attempts(),
                    "Job failed, requeueing for retry"
                );
                if let Err(requeue_err) = self.queue.retry(job).await {
                    error!(worker_id = %self.id, job_id = %job_id, error = %requeue_err, "Failed to requeue job");
                }
                JobStatus::Retried
            }
            Err(e) => {
                self.stats.record_failure(duration);
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Job failed, moving to dead letter queue"
                );
                if let Err(dlq_err) = self.queue.fail(&job, &e.to_string()).await {
                    error!(worker_id = %self.id, job_id = %job_id, error = %dlq_err, "Failed to move job to dead letter queue");
                }
                if matches!(e, JobError::Timeout(_)) {
                    JobStatus::Timeout
                } else {
                    JobStatus::Failed
                }
            }
        };

        self.metrics
            .record_job(&self.queue_name, &status.to_string(), duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::memory::MemoryQueue;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` calls, then echoes the payload.
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
        permanent: bool,
        delay: Duration,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                permanent: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, job: &Job) -> Result<serde_json::Value, JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.permanent {
                return Err(JobError::InvalidPayload("bad".to_string()));
            }
            if call < self.failures {
                return Err(JobError::Failed(format!("attempt {}", call + 1)));
            }
            Ok(job.data.clone())
        }
    }

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig::new(2)
            .with_queue_name("q")
            .with_poll_interval(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    async fn wait_for<F: Fn(&PoolStats) -> bool>(pool: &WorkerPool, done: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&pool.stats()) {
            assert!(Instant::now() < deadline, "pool did not settle: {:?}", pool.stats());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(0)
            .with_queue_name("testing-analysis")
            .with_poll_interval(Duration::from_secs(5))
            .with_job_timeout(Duration::from_secs(30))
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 1);
        assert_eq!(config.queue_name, "testing-analysis");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.job_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));
        stats.increment_active();

        let pool_stats = stats.to_pool_stats(4);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        assert_eq!(pool_stats.active_workers, 1);
        // (10000 + 20000 + 5000) / 3
        assert_eq!(pool_stats.average_job_duration.as_millis(), 11666);
    }

    #[tokio::test]
    async fn test_pool_completes_jobs() {
        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue(Job::new("q", json!({"n": 7}))).await.unwrap();

        let mut pool = WorkerPool::new(config(), queue.clone(), Arc::new(FlakyHandler::new(0)));
        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        wait_for(&pool, |s| s.jobs_completed == 1).await;
        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));

        let stats = queue.stats("q").await.unwrap();
        assert_eq!(stats.total_jobs(), 0);
    }

    #[tokio::test]
    async fn test_pool_retries_then_dead_letters() {
        let queue = Arc::new(MemoryQueue::new());
        queue
            .enqueue(Job::new("q", json!({})).with_max_attempts(2))
            .await
            .unwrap();

        let handler = Arc::new(FlakyHandler::new(u32::MAX));
        let mut pool = WorkerPool::new(config(), queue.clone(), handler.clone());
        pool.start().await.unwrap();
        wait_for(&pool, |s| s.jobs_failed == 2).await;
        pool.shutdown().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let entries = queue.peek_dead_letter("q", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["error"], "Job failed: attempt 2");
        assert_eq!(entries[0]["job"]["attempts"], 2);
    }

    #[tokio::test]
    async fn test_pool_recovers_from_transient_failure() {
        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue(Job::new("q", json!("ok"))).await.unwrap();

        let mut pool = WorkerPool::new(config(), queue.clone(), Arc::new(FlakyHandler::new(1)));
        pool.start().await.unwrap();
        wait_for(&pool, |s| s.jobs_completed == 1).await;
        pool.shutdown().await.unwrap();

        assert_eq!(pool.stats().jobs_failed, 1);
        assert!(queue.peek_dead_letter("q", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_payload_is_not_retried() {
        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue(Job::new("q", json!({}))).await.unwrap();

        let handler = Arc::new(FlakyHandler {
            permanent: true,
            ..FlakyHandler::new(0)
        });
        let mut pool = WorkerPool::new(config(), queue.clone(), handler.clone());
        pool.start().await.unwrap();
        wait_for(&pool, |s| s.jobs_failed == 1).await;
        pool.shutdown().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats("q").await.unwrap().dead_letter_jobs, 1);
    }

    #[tokio::test]
    async fn test_job_timeout_dead_letters() {
        let queue = Arc::new(MemoryQueue::new());
        queue
            .enqueue(Job::new("q", json!({})).with_max_attempts(1))
            .await
            .unwrap();

        let handler = Arc::new(FlakyHandler {
            delay: Duration::from_secs(10),
            ..FlakyHandler::new(0)
        });
        let mut pool = WorkerPool::new(
            config().with_job_timeout(Duration::from_millis(50)),
            queue.clone(),
            handler,
        );
        pool.start().await.unwrap();
        wait_for(&pool, |s| s.jobs_failed == 1).await;
        pool.shutdown().await.unwrap();

        let entries = queue.peek_dead_letter("q", 1).await.unwrap();
        assert!(entries[0]["error"].as_str().unwrap().contains("timed out"));
    }
}
