//! HTTP client for agents that accept `POST {taskId, requirement}` and
//! answer with a submission.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use super::AgentClient;
use crate::error::AgentError;
use crate::evaluation::{Submission, TaskRequest};

/// Default time an agent has to answer.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest error body kept in an `AgentError::Status`.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Agent client over reqwest.
#[derive(Clone)]
pub struct HttpAgentClient {
    http_client: Client,
    timeout: Duration,
}

impl HttpAgentClient {
    /// # Errors
    ///
    /// Returns `AgentError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Accepts absolute http(s) URLs only.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, AgentError> {
    let invalid = |reason: &str| AgentError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(endpoint.trim()).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(&format!("unsupported scheme '{}'", other))),
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn send_task(&self, endpoint: &str, task: &TaskRequest) -> Result<Submission, AgentError> {
        let url = parse_endpoint(endpoint)?;
        debug!(url = %url, task_id = %task.task_id, "Sending task to agent");

        let response = self
            .http_client
            .post(url)
            .json(task)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::RequestFailed(format!(
                        "agent did not answer within {} seconds",
                        self.timeout.as_secs()
                    ))
                } else {
                    AgentError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Status {
                code: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| AgentError::RequestFailed(e.to_string()))?;
        serde_json::from_str::<Submission>(&body)
            .map_err(|e| AgentError::InvalidSubmission(e.to_string()))
    }
}
