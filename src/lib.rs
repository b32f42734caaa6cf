//! debt-forge: contextual debt evaluation for agent submissions.
//!
//! An evaluation asks an external agent to solve a task, then scores the
//! submission on three dimensions in parallel jobs:
//!
//! - **rationale**: an LLM judges each reasoning step for unused context
//! - **architectural coherence**: static complexity of the source
//! - **testing verification**: the agent's tests run in a sandbox
//!
//! The parent job of the flow averages the three into the contextual debt
//! score and finalizes the evaluation record.

pub mod agent;
pub mod analysis;
pub mod api;
pub mod cli;
pub mod error;
pub mod evaluation;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod sandbox;
pub mod scheduler;
pub mod storage;
pub mod utils;

// Re-export commonly used error types
pub use error::{AgentError, LlmError, SandboxError};
