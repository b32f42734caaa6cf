//! LiteLLM-compatible chat completion client.
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint (LiteLLM
//! proxy, OpenRouter, a local gateway). The judge in the rationale
//! analyzer is the only caller, but the [`LlmProvider`] trait keeps the
//! analyzer testable against scripted providers.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::debug;

use crate::error::LlmError;

/// Default OpenRouter-style API base used when only an API key is known.
pub const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

/// Default judge model.
pub const DEFAULT_MODEL: &str = "anthropic/claude-opus-4.5";

/// Transport timeout for a single completion request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender ("system", "user" or "assistant").
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Request for text generation from an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Model identifier. Empty means the client's default model.
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Asks the provider for a JSON object response.
    #[serde(skip)]
    pub json_mode: bool,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            json_mode: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// Response from an LLM generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl GenerationResponse {
    /// Builds a single-choice response. Used by scripted providers.
    pub fn from_content(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::default(),
        }
    }

    /// Get the content of the first choice, if available.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// A single generated choice from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    /// Reason the generation stopped (e.g., "stop", "length").
    pub finish_reason: String,
}

/// Token usage statistics for a generation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Trait for LLM providers that can generate text.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a response for the given request.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// Client for LiteLLM-compatible APIs.
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    http_client: Client,
}

impl LiteLlmClient {
    /// Create a new LiteLLM client with explicit configuration.
    ///
    /// # Arguments
    ///
    /// * `api_base` - Base URL for the API (e.g., "http://localhost:4000")
    /// * `api_key` - Optional API key for authentication
    /// * `default_model` - Model used when a request leaves `model` empty
    ///
    /// # Errors
    ///
    /// Returns `LlmError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            http_client,
        })
    }

    /// Create a client pre-configured for OpenRouter.
    pub fn new_with_defaults(api_key: String) -> Result<Self, LlmError> {
        Self::new(OPENROUTER_API_BASE, Some(api_key), DEFAULT_MODEL)
    }

    /// Create a client from environment variables.
    ///
    /// Reads:
    /// - `LITELLM_API_BASE`: Base URL for the API
    /// - `LITELLM_API_KEY`: API key (optional)
    /// - `LITELLM_DEFAULT_MODEL`: Default model
    /// - `OPENROUTER_API_KEY`: used with the OpenRouter base when
    ///   `LITELLM_API_BASE` is unset
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiBase` if neither `LITELLM_API_BASE` nor
    /// `OPENROUTER_API_KEY` is set.
    pub fn from_env() -> Result<Self, LlmError> {
        let default_model =
            env::var("LITELLM_DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        match env::var("LITELLM_API_BASE") {
            Ok(api_base) => Self::new(api_base, env::var("LITELLM_API_KEY").ok(), default_model),
            Err(_) => {
                let api_key =
                    env::var("OPENROUTER_API_KEY").map_err(|_| LlmError::MissingApiBase)?;
                Self::new(OPENROUTER_API_BASE, Some(api_key), default_model)
            }
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Request body for the OpenAI-compatible API.
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    index: u32,
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model.clone()
        };

        let api_request = ApiRequest {
            model: model.clone(),
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let url = format!("{}/chat/completions", self.api_base);
        debug!(model = %model, url = %url, "Sending completion request");

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Title", "debt-forge");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request.json(&api_request).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    seconds: HTTP_TIMEOUT.as_secs(),
                }
            } else {
                LlmError::RequestFailed(e.to_string())
            }
        })?;

        let status = http_response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|r| r.error.message)
                .unwrap_or(error_text);

            if status_code == 429 {
                return Err(LlmError::RateLimited(message));
            }
            return Err(LlmError::ApiError {
                code: status_code,
                message,
            });
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        if api_response.choices.is_empty() {
            return Err(LlmError::ParseError("response contained no choices".to_string()));
        }

        let choices = api_response
            .choices
            .into_iter()
            .map(|choice| Choice {
                index: choice.index,
                message: Message {
                    role: choice.message.role.unwrap_or_else(|| "assistant".to_string()),
                    content: choice.message.content.unwrap_or_default(),
                },
                finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            })
            .collect();

        Ok(GenerationResponse {
            id: api_response.id,
            model: if api_response.model.is_empty() {
                model
            } else {
                api_response.model
            },
            choices,
            usage: api_response.usage.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("s").role, "system");
        assert_eq!(Message::user("u").role, "user");
        assert_eq!(Message::assistant("a").content, "a");
    }

    #[test]
    fn test_request_builder() {
        let request = GenerationRequest::new("judge", vec![Message::user("hi")])
            .with_temperature(0.0)
            .with_max_tokens(512)
            .with_json_mode();
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.max_tokens, Some(512));
        assert!(request.json_mode);

        let json = serde_json::to_value(&request).expect("serialize");
        assert!(json.get("json_mode").is_none());
    }

    #[test]
    fn test_client_normalizes_api_base() {
        let client =
            LiteLlmClient::new("http://localhost:4000/", None, "judge").expect("client");
        assert_eq!(client.api_base(), "http://localhost:4000");
        assert_eq!(client.default_model(), "judge");
        assert!(!client.has_api_key());
    }

    #[test]
    fn test_openrouter_defaults() {
        let client = LiteLlmClient::new_with_defaults("key".to_string()).expect("client");
        assert_eq!(client.api_base(), OPENROUTER_API_BASE);
        assert_eq!(client.default_model(), DEFAULT_MODEL);
        assert!(client.has_api_key());
    }

    #[test]
    fn test_api_response_tolerates_missing_fields() {
        let body = r#"{"choices":[{"message":{"content":"{\"debtIncurred\":false}"}}]}"#;
        let response: ApiResponse = serde_json::from_str(body).expect("parse");
        assert_eq!(response.choices.len(), 1);
        assert!(response.usage.is_none());
    }

    #[test]
    fn test_from_content() {
        let response = GenerationResponse::from_content("m", "hello");
        assert_eq!(response.first_content(), Some("hello"));
    }

    #[tokio::test]
    #[ignore = "requires LITELLM_API_BASE or OPENROUTER_API_KEY"]
    async fn test_live_completion() {
        let client = LiteLlmClient::from_env().expect("client");
        let response = client
            .generate(GenerationRequest::new("", vec![Message::user("Reply with {}")]))
            .await
            .expect("response");
        assert!(response.first_content().is_some());
    }
}
