//! Wiring of backends, analyzers and worker pools from configuration.
//!
//! `redis_url` and `database_url` choose between the shared backends and
//! their in-process counterparts. The in-process queue only reaches
//! workers running in the same process, so `serve` runs its own workers
//! when no Redis URL is configured.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::config::{EvaluatorConfig, SandboxBackend};
use super::handlers::{AggregationHandler, ArchitecturalHandler, RationaleHandler, TestingHandler};
use super::orchestrator::EvaluationOrchestrator;
use crate::agent::{AgentClient, HttpAgentClient};
use crate::analysis::{ArchitecturalAnalyzer, RationaleAnalyzer, TestingAnalyzer};
use crate::error::{AgentError, LlmError, SandboxError};
use crate::evaluation::{ARCHITECTURAL_QUEUE, EVALUATION_FLOW_QUEUE, RATIONALE_QUEUE, TESTING_QUEUE};
use crate::llm::{LiteLlmClient, LlmProvider};
use crate::sandbox::{DockerIsolateProvider, IsolateProvider, NodeIsolateProvider, SandboxExecutor};
use crate::scheduler::{
    JobHandler, MemoryQueue, PoolError, PoolStats, QueueBackend, QueueError, RedisQueue,
    WorkerPool, WorkerPoolConfig,
};
use crate::storage::{
    Database, EvaluationStore, MemoryEvaluationStore, MemoryTaskPool, StoreError, TaskPool,
};

/// Errors raised while assembling the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Shared backends for one process.
#[derive(Clone)]
pub struct Runtime {
    pub config: EvaluatorConfig,
    pub queue: Arc<dyn QueueBackend>,
    pub store: Arc<dyn EvaluationStore>,
    pub tasks: Arc<dyn TaskPool>,
}

impl Runtime {
    /// Connects the queue and storage selected by `config`.
    pub async fn connect(config: EvaluatorConfig) -> Result<Self, RuntimeError> {
        let queue = connect_queue(&config).await?;
        let (store, tasks) = connect_storage(&config).await?;
        Ok(Self {
            config,
            queue,
            store,
            tasks,
        })
    }

    /// Assembles a runtime from existing backends.
    pub fn from_parts(
        config: EvaluatorConfig,
        queue: Arc<dyn QueueBackend>,
        store: Arc<dyn EvaluationStore>,
        tasks: Arc<dyn TaskPool>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            tasks,
        }
    }

    /// Returns whether the queue is visible to other processes.
    pub fn has_shared_queue(&self) -> bool {
        self.config.redis_url.is_some()
    }

    /// Builds an orchestrator that calls agents over HTTP.
    pub fn orchestrator(&self) -> Result<EvaluationOrchestrator, RuntimeError> {
        let agent = HttpAgentClient::new(self.config.agent_timeout)?;
        Ok(self.orchestrator_with_agent(Arc::new(agent)))
    }

    pub fn orchestrator_with_agent(&self, agent: Arc<dyn AgentClient>) -> EvaluationOrchestrator {
        EvaluationOrchestrator::new(
            Arc::clone(&self.tasks),
            Arc::clone(&self.store),
            agent,
            Arc::clone(&self.queue),
        )
        .with_job_max_attempts(self.config.job_max_attempts)
    }

    /// Builds the worker pools for every evaluation queue.
    pub fn workers(&self, analyzers: Analyzers) -> WorkerSet {
        let aggregation: Arc<dyn JobHandler> = Arc::new(AggregationHandler::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
        ));
        let rationale: Arc<dyn JobHandler> = Arc::new(RationaleHandler::new(analyzers.rationale));
        let architectural: Arc<dyn JobHandler> =
            Arc::new(ArchitecturalHandler::new(analyzers.architectural));
        let testing: Arc<dyn JobHandler> = Arc::new(TestingHandler::new(analyzers.testing));

        let handlers = [
            (EVALUATION_FLOW_QUEUE, aggregation),
            (RATIONALE_QUEUE, rationale),
            (ARCHITECTURAL_QUEUE, architectural),
            (TESTING_QUEUE, testing),
        ];

        let pools = handlers
            .into_iter()
            .map(|(queue_name, handler)| {
                let pool_config = WorkerPoolConfig::new(self.config.workers_per_queue)
                    .with_queue_name(queue_name)
                    .with_poll_interval(self.config.poll_interval)
                    .with_job_timeout(self.config.job_timeout);
                WorkerPool::new(pool_config, Arc::clone(&self.queue), handler)
            })
            .collect();

        WorkerSet { pools }
    }
}

/// Connects Redis when configured, otherwise returns an in-process queue.
pub async fn connect_queue(config: &EvaluatorConfig) -> Result<Arc<dyn QueueBackend>, QueueError> {
    match &config.redis_url {
        Some(url) => {
            let queue = RedisQueue::connect(url, &config.queue_prefix).await?;
            info!(prefix = %config.queue_prefix, "Connected to Redis queue");
            Ok(Arc::new(queue))
        }
        None => {
            info!("REDIS_URL not set, using in-process queue");
            Ok(Arc::new(MemoryQueue::new()))
        }
    }
}

/// Connects PostgreSQL when configured, otherwise returns in-memory stores.
///
/// The in-memory task pool is seeded from `task_file` when one is set.
pub async fn connect_storage(
    config: &EvaluatorConfig,
) -> Result<(Arc<dyn EvaluationStore>, Arc<dyn TaskPool>), StoreError> {
    if let Some(url) = &config.database_url {
        let db = Arc::new(Database::connect(url).await?);
        let applied = db.run_migrations().await?;
        info!(applied = applied, "Connected to PostgreSQL");
        return Ok((db.clone(), db));
    }

    let tasks = match &config.task_file {
        Some(path) => {
            let pool = MemoryTaskPool::from_json_file(path).await?;
            info!(path = %path.display(), tasks = pool.len(), "Loaded task file");
            pool
        }
        None => {
            warn!("DATABASE_URL and DEBT_FORGE_TASK_FILE not set, task pool is empty");
            MemoryTaskPool::default()
        }
    };

    Ok((Arc::new(MemoryEvaluationStore::new()), Arc::new(tasks)))
}

/// Builds the isolate provider for the configured sandbox backend.
pub fn build_isolate_provider(
    config: &EvaluatorConfig,
) -> Result<Arc<dyn IsolateProvider>, SandboxError> {
    match config.sandbox_backend {
        SandboxBackend::Process => Ok(Arc::new(NodeIsolateProvider::new(
            config.node_binary.clone(),
        ))),
        SandboxBackend::Docker => Ok(Arc::new(DockerIsolateProvider::connect(
            config.sandbox_image.clone(),
        )?)),
    }
}

/// The three analyzers, configured.
#[derive(Clone)]
pub struct Analyzers {
    pub rationale: RationaleAnalyzer,
    pub architectural: ArchitecturalAnalyzer,
    pub testing: TestingAnalyzer,
}

impl Analyzers {
    /// Builds analyzers with the LLM client from the environment.
    pub fn from_config(config: &EvaluatorConfig) -> Result<Self, RuntimeError> {
        let llm = LiteLlmClient::from_env()?;
        let provider = build_isolate_provider(config)?;
        Ok(Self::with_collaborators(config, Arc::new(llm), provider))
    }

    /// Builds analyzers around injected collaborators.
    pub fn with_collaborators(
        config: &EvaluatorConfig,
        llm: Arc<dyn LlmProvider>,
        isolates: Arc<dyn IsolateProvider>,
    ) -> Self {
        let rationale = RationaleAnalyzer::new(llm, "")
            .with_temperature(config.llm_temperature)
            .with_step_timeout(config.rationale_step_timeout)
            .with_total_budget(config.rationale_budget());
        let architectural = ArchitecturalAnalyzer::new()
            .with_ceiling(config.maintainability_ceiling)
            .with_complexity_threshold(config.complexity_threshold);
        let testing = TestingAnalyzer::new(SandboxExecutor::new(isolates, config.sandbox_limits()));

        Self {
            rationale,
            architectural,
            testing,
        }
    }
}

/// One worker pool per evaluation queue.
pub struct WorkerSet {
    pools: Vec<WorkerPool>,
}

impl WorkerSet {
    pub async fn start(&mut self) -> Result<(), PoolError> {
        for pool in &mut self.pools {
            pool.start().await?;
        }
        Ok(())
    }

    /// Stops every pool, reporting the first failure after all were asked.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        let mut first_error = None;
        for pool in &mut self.pools {
            if let Err(e) = pool.shutdown().await {
                warn!(queue = pool.queue_name(), error = %e, "Worker pool did not stop cleanly");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        self.pools
            .iter()
            .map(|pool| (pool.queue_name().to_string(), pool.stats()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_in_process_backends_by_default() {
        let config = EvaluatorConfig::default();
        let runtime = Runtime::connect(config).await.unwrap();
        assert_eq!(runtime.queue.name(), "memory");
        assert!(!runtime.has_shared_queue());
        assert!(runtime.tasks.get_all_thoughts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_task_file_is_an_error() {
        let config = EvaluatorConfig::default().with_task_file("/nonexistent/tasks.json");
        let err = connect_storage(&config).await.err().unwrap();
        assert!(matches!(err, StoreError::TaskFile { .. }));
    }

    #[tokio::test]
    async fn test_task_file_seeds_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("tasks.json");
        tokio::fs::write(&path, r#"[{"id": "t-1", "content": "Write add(a, b)."}]"#)
            .await
            .unwrap();

        let config = EvaluatorConfig::default().with_task_file(path.clone());
        let (_, tasks) = connect_storage(&config).await.unwrap();
        let tasks = tasks.get_all_thoughts().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "t-1");
    }

    #[tokio::test]
    async fn test_worker_set_covers_every_queue() {
        let runtime = Runtime::connect(EvaluatorConfig::default().with_workers_per_queue(1))
            .await
            .unwrap();
        let analyzers = Analyzers::with_collaborators(
            &runtime.config,
            Arc::new(NoopLlm),
            Arc::new(NodeIsolateProvider::default()),
        );

        let mut workers = runtime.workers(analyzers);
        assert_eq!(workers.len(), 4);
        workers.start().await.unwrap();
        let queues: Vec<String> = workers.stats().into_iter().map(|(q, _)| q).collect();
        assert!(queues.contains(&TESTING_QUEUE.to_string()));
        workers.shutdown().await.unwrap();
    }

    struct NoopLlm;

    #[async_trait::async_trait]
    impl LlmProvider for NoopLlm {
        async fn generate(
            &self,
            _request: crate::llm::GenerationRequest,
        ) -> Result<crate::llm::GenerationResponse, LlmError> {
            Err(LlmError::RequestFailed("offline".to_string()))
        }
    }
}
