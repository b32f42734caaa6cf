//! LLM integration for debt-forge.
//!
//! The rationale analyzer judges each reasoning step through an
//! [`LlmProvider`]. Production uses [`LiteLlmClient`] against any
//! OpenAI-compatible endpoint:
//!
//! ```ignore
//! use debt_forge::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
//!
//! let client = LiteLlmClient::from_env()?;
//! let request = GenerationRequest::new("", vec![Message::user("Hello!")]);
//! let response = client.generate(request).await?;
//! ```

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_MODEL, OPENROUTER_API_BASE,
};
