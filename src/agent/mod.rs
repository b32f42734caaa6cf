//! Client for the external agent that turns a task into a submission.

pub mod http;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::evaluation::{Submission, TaskRequest};

pub use http::{parse_endpoint, HttpAgentClient, DEFAULT_AGENT_TIMEOUT};

/// Sends a task to an agent and returns what it built.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn send_task(&self, endpoint: &str, task: &TaskRequest) -> Result<Submission, AgentError>;
}
