//! Evaluation pipeline.
//!
//! - **Orchestrator**: picks a task, calls the agent and dispatches the flow
//! - **Handlers**: one job handler per analyzer queue, plus aggregation
//! - **Aggregation**: folds child outcomes into the final verdict
//! - **Runtime**: builds backends, analyzers and worker pools from config
//! - **Config**: environment-driven evaluator settings
//!
//! # Example
//!
//! ```rust,ignore
//! use debt_forge::pipeline::{Analyzers, EvaluatorConfig, Runtime};
//!
//! let config = EvaluatorConfig::from_env()?;
//! let runtime = Runtime::connect(config).await?;
//!
//! let mut workers = runtime.workers(Analyzers::from_config(&runtime.config)?);
//! workers.start().await?;
//!
//! let orchestrator = runtime.orchestrator()?;
//! let id = orchestrator.start_evaluation("http://localhost:9009/task").await?;
//! ```

pub mod aggregation;
pub mod config;
pub mod handlers;
pub mod orchestrator;
pub mod runtime;

pub use aggregation::aggregate;
pub use config::{ConfigError, EvaluatorConfig, SandboxBackend};
pub use handlers::{AggregationHandler, ArchitecturalHandler, RationaleHandler, TestingHandler};
pub use orchestrator::{build_flow, EvaluationOrchestrator, OrchestratorError};
pub use runtime::{
    build_isolate_provider, connect_queue, connect_storage, Analyzers, Runtime, RuntimeError,
    WorkerSet,
};
