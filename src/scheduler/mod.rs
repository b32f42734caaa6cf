//! Job substrate: named queues, parent/child flows and worker pools.
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │   Orchestrator   │  add_flow(parent + 3 children)
//!                 └────────┬─────────┘
//!                          │
//!        ┌─────────────────┼──────────────────┐
//!        ▼                 ▼                  ▼
//!  rationale-analysis  architectural-   testing-analysis
//!        │             analysis │             │
//!        └─────────────────┼──────────────────┘
//!                          │ last child finished
//!                          ▼
//!                   evaluation-flow  ──►  aggregation handler
//! ```
//!
//! - `job`: jobs, flows and child outcomes
//! - `backend`: the `QueueBackend` and `JobHandler` seams
//! - `queue`: Redis backend (BRPOPLPUSH dequeue, Lua flow release)
//! - `memory`: in-process backend with the same semantics
//! - `worker_pool`: per-queue workers with retry and dead-lettering

pub mod backend;
pub mod job;
pub mod memory;
pub mod queue;
pub mod worker_pool;

pub use backend::{JobHandler, QueueBackend, QueueError, QueueStats, RESULT_TTL_SECS};
pub use job::{
    ChildOutcome, ChildStatus, Flow, Job, JobError, JobStatus, ParentRef, DEFAULT_MAX_ATTEMPTS,
};
pub use memory::MemoryQueue;
pub use queue::{RedisQueue, DEFAULT_KEY_PREFIX};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
