//! Remote LLM access.
//!
//! Two modes: free-form completion with exponential backoff on transient
//! network errors, and schema-validated completion that additionally retries
//! parse/validation failures by re-issuing the request with a feedback block
//! (the prior raw output plus the validator's error messages). The two retry
//! kinds have separate budgets: mixing them under-retries one or over-retries
//! the other.

mod client;

pub use client::{HttpLlm, LlmConfig};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Network(err.to_string())
    }
}

impl LlmError {
    /// Network-budget retryable errors; schema failures retry on the parse
    /// budget instead.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Network(_) | LlmError::RateLimited(_))
    }
}

/// Seam for the pipeline; tests drive it with scripted fakes.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Free-form completion: `prompt` is the instruction, `context` the
    /// documents it applies to.
    async fn complete(&self, prompt: &str, context: &[String]) -> Result<String, LlmError>;

    /// Schema-validated completion; the returned value conforms to `schema`.
    async fn complete_structured(
        &self,
        prompt: &str,
        context: &[String],
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError>;
}
