//! OpenAI-compatible chat completion client.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use reflector_config::LlmSettings;

use crate::{LanguageModel, LlmError};

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    pub network_attempts: u32,
    pub parse_attempts: u32,
    pub initial_backoff: Duration,
    pub wait_jitter: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1024,
            temperature: 0.4,
            timeout: Duration::from_secs(120),
            network_attempts: 5,
            parse_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            wait_jitter: true,
        }
    }
}

impl From<&LlmSettings> for LlmConfig {
    fn from(settings: &LlmSettings) -> Self {
        Self {
            endpoint: settings.url.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            timeout: Duration::from_secs(settings.timeout_seconds),
            network_attempts: settings.retry_network_attempts,
            parse_attempts: settings.retry_parse_attempts,
            wait_jitter: settings.retry_wait_jitter,
            ..Default::default()
        }
    }
}

pub struct HttpLlm {
    config: LlmConfig,
    client: Client,
}

impl HttpLlm {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        )
    }

    async fn execute_request(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let mut builder = self.client.post(self.chat_url()).json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                LlmError::Network(e.to_string())
            } else {
                LlmError::Api(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => LlmError::RateLimited(body),
                s if s >= 500 => LlmError::Network(format!("HTTP {status}: {body}")),
                _ => LlmError::Api(format!("HTTP {status}: {body}")),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?;
        Ok(choice.message.content)
    }

    /// Retry loop for the network budget; transient errors back off
    /// exponentially with optional jitter.
    async fn complete_with_retry(&self, messages: Vec<ChatMessage>) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
        };

        let mut backoff = self.config.initial_backoff;
        let mut last_error = None;
        for attempt in 1..=self.config.network_attempts {
            if attempt > 1 {
                let wait = if self.config.wait_jitter {
                    let jitter = rand::thread_rng().gen_range(0.0..=0.5);
                    backoff.mul_f64(1.0 + jitter)
                } else {
                    backoff
                };
                tracing::warn!(
                    attempt,
                    max = self.config.network_attempts,
                    wait_ms = wait.as_millis() as u64,
                    "LLM request failed, retrying"
                );
                tokio::time::sleep(wait).await;
                backoff *= 2;
            }
            match self.execute_request(&request).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| LlmError::Network("retries exhausted".to_string())))
    }

    fn build_messages(&self, prompt: &str, context: &[String]) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: prompt.to_string(),
        }];
        for text in context {
            messages.push(ChatMessage {
                role: "user".to_string(),
                content: text.clone(),
            });
        }
        messages
    }
}

#[async_trait]
impl LanguageModel for HttpLlm {
    async fn complete(&self, prompt: &str, context: &[String]) -> Result<String, LlmError> {
        self.complete_with_retry(self.build_messages(prompt, context))
            .await
    }

    async fn complete_structured(
        &self,
        prompt: &str,
        context: &[String],
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let compiled = jsonschema::JSONSchema::compile(schema)
            .map_err(|e| LlmError::Configuration(format!("bad schema: {e}")))?;

        let base_prompt = format!(
            "{prompt}\n\nRespond with a single JSON object matching this JSON schema, no prose:\n{}",
            serde_json::to_string_pretty(schema).unwrap_or_default()
        );

        let mut feedback: Option<String> = None;
        let mut last_error = LlmError::InvalidResponse("no attempts made".to_string());

        for attempt in 1..=self.config.parse_attempts {
            let full_prompt = match &feedback {
                Some(fb) => format!("{base_prompt}\n\n{fb}"),
                None => base_prompt.clone(),
            };
            let raw = self
                .complete_with_retry(self.build_messages(&full_prompt, context))
                .await?;

            match parse_and_validate(&raw, &compiled) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max = self.config.parse_attempts,
                        error = %e,
                        "structured response failed validation"
                    );
                    feedback = Some(format!(
                        "Your previous response was invalid.\n\
                         Previous response:\n{raw}\n\nErrors:\n{e}\n\
                         Return only a corrected JSON object."
                    ));
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Pull the first JSON object out of a possibly fenced response and validate
/// it against the compiled schema.
fn parse_and_validate(
    raw: &str,
    schema: &jsonschema::JSONSchema,
) -> Result<serde_json::Value, LlmError> {
    let candidate = extract_json(raw)
        .ok_or_else(|| LlmError::InvalidResponse("no JSON object in response".to_string()))?;
    let value: serde_json::Value = serde_json::from_str(candidate)
        .map_err(|e| LlmError::InvalidResponse(format!("JSON parse error: {e}")))?;

    let messages: Vec<String> = match schema.validate(&value) {
        Ok(()) => return Ok(value),
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    };
    Err(LlmError::SchemaValidation(messages.join("; ")))
}

fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}
