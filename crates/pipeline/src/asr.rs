//! Remote transcription service client.
//!
//! The service receives a presigned audio URL plus a language and returns a
//! word list with track-local timestamps; the caller shifts them into
//! meeting-global time (a no-op for padded tracks, which begin at meeting
//! t=0).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use reflector_config::AsrSettings;
use reflector_core::Word;

#[derive(Debug, thiserror::Error)]
pub enum AsrError {
    /// Network failure or 5xx; retried.
    #[error("transient transcription error: {0}")]
    Transient(String),
    /// The service could not decode the audio; fails the task.
    #[error("invalid media: {0}")]
    InvalidMedia(String),
    /// 429; retried with a longer backoff.
    #[error("transcription quota exceeded: {0}")]
    Quota(String),
    #[error("transcription error: {0}")]
    Other(String),
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe the audio behind `audio_url`. Timestamps in the result are
    /// track-local seconds.
    async fn transcribe(&self, audio_url: &str, language: &str) -> Result<Vec<Word>, AsrError>;
}

#[derive(Debug, Serialize)]
struct TranscribeRequest<'a> {
    audio_url: &'a str,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    words: Vec<AsrWord>,
}

#[derive(Debug, Deserialize)]
struct AsrWord {
    text: String,
    start: f64,
    end: f64,
}

pub struct HttpAsr {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    attempts: u32,
}

impl HttpAsr {
    pub fn new(settings: &AsrSettings) -> Result<Self, AsrError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .map_err(|e| AsrError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            attempts: 3,
        })
    }

    async fn execute(&self, audio_url: &str, language: &str) -> Result<Vec<Word>, AsrError> {
        let mut builder = self
            .client
            .post(format!("{}/v1/transcribe", self.base_url))
            .json(&TranscribeRequest {
                audio_url,
                language,
            });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AsrError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                415 | 422 => AsrError::InvalidMedia(body),
                429 => AsrError::Quota(body),
                s if s >= 500 => AsrError::Transient(format!("HTTP {status}: {body}")),
                _ => AsrError::Other(format!("HTTP {status}: {body}")),
            });
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| AsrError::Other(format!("bad transcription response: {e}")))?;
        Ok(parsed
            .words
            .into_iter()
            .map(|w| Word {
                text: w.text,
                start: w.start,
                end: w.end,
                speaker: 0,
            })
            .collect())
    }
}

#[async_trait]
impl SpeechToText for HttpAsr {
    async fn transcribe(&self, audio_url: &str, language: &str) -> Result<Vec<Word>, AsrError> {
        let mut backoff = Duration::from_secs(1);
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match self.execute(audio_url, language).await {
                Ok(words) => return Ok(words),
                Err(e @ AsrError::Transient(_)) => {
                    tracing::warn!(attempt, error = %e, "transcription attempt failed");
                    last_error = Some(e);
                }
                Err(e @ AsrError::Quota(_)) => {
                    tracing::warn!(attempt, error = %e, "transcription rate limited");
                    // Quota pushback backs off harder than plain 5xx.
                    backoff = backoff.max(Duration::from_secs(10));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| AsrError::Other("retries exhausted".to_string())))
    }
}
