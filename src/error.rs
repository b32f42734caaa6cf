//! Error types for debt-forge operations.
//!
//! Defines the error types shared across subsystems:
//! - LLM API interactions
//! - Agent task dispatch
//! - Sandboxed test execution
//!
//! Subsystems with a narrower audience (queue, worker pool, storage,
//! configuration) keep their error enums next to the code that raises them.

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("LLM request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
}

/// Errors raised while handing a task to the external agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid agent endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Agent request failed: {0}")]
    RequestFailed(String),

    #[error("Agent responded with status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Agent returned an invalid submission: {0}")]
    InvalidSubmission(String),
}

/// Errors that can occur while provisioning or driving a sandbox isolate.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to provision sandbox: {0}")]
    ProvisionFailed(String),

    #[error("Path '{path}' escapes the sandbox working directory")]
    PathEscape { path: String },

    #[error("Invalid sandbox path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("File exceeds the sandbox limit of {limit} bytes")]
    FileTooLarge { limit: usize },

    #[error("Isolate exited before reporting: {0}")]
    IsolateExited(String),

    #[error("Isolate protocol violation: {0}")]
    Protocol(String),

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Docker operation failed: {0}")]
    Docker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
