//! Settings for the Reflector pipeline.
//!
//! Loaded from `config/default.{yaml,toml,json}`, an optional per-environment
//! file, and `REFLECTOR__`-prefixed environment variables
//! (e.g. `REFLECTOR__PIPELINE__TOPIC_CHUNK_WORD_COUNT=200`).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub asr: AsrSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub zulip: ZulipSettings,
    #[serde(default)]
    pub webhook: WebhookSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local data directory for waveforms (`{data_dir}/{transcript_id}/audio.json`).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    1250
}
fn default_data_dir() -> String {
    "data".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite URL, e.g. `sqlite://reflector.db` or `sqlite::memory:`.
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    "sqlite://reflector.db".to_string()
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Bucket holding transcript artifacts (padded tracks, mixed audio).
    #[serde(default = "default_transcript_bucket")]
    pub transcript_bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores (minio etc.).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_presign_ttl")]
    pub presigned_url_ttl_seconds: u64,
}

fn default_transcript_bucket() -> String {
    "reflector-transcripts".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_presign_ttl() -> u64 {
    3600
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            transcript_bucket: default_transcript_bucket(),
            region: default_region(),
            endpoint_url: None,
            presigned_url_ttl_seconds: default_presign_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrSettings {
    /// Base URL of the remote transcription service.
    #[serde(default = "default_asr_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_asr_timeout")]
    pub timeout_seconds: u64,
}

fn default_asr_url() -> String {
    "http://127.0.0.1:9081".to_string()
}
fn default_asr_timeout() -> u64 {
    600
}

impl Default for AsrSettings {
    fn default() -> Self {
        Self {
            url: default_asr_url(),
            api_key: None,
            timeout_seconds: default_asr_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
    /// Retry budget for network/rate-limit failures.
    #[serde(default = "default_network_attempts")]
    pub retry_network_attempts: u32,
    /// Retry budget for schema/JSON parse failures of structured responses.
    #[serde(default = "default_parse_attempts")]
    pub retry_parse_attempts: u32,
    #[serde(default = "default_true")]
    pub retry_wait_jitter: bool,
}

fn default_llm_url() -> String {
    "http://127.0.0.1:11434/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_max_tokens() -> u32 {
    1024
}
fn default_llm_temperature() -> f32 {
    0.4
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_network_attempts() -> u32 {
    5
}
fn default_parse_attempts() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            api_key: None,
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            timeout_seconds: default_llm_timeout(),
            retry_network_attempts: default_network_attempts(),
            retry_parse_attempts: default_parse_attempts(),
            retry_wait_jitter: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_waveform_segments")]
    pub waveform_segments: usize,
    #[serde(default = "default_topic_chunk_words")]
    pub topic_chunk_word_count: usize,
    #[serde(default = "default_timeout_short")]
    pub timeout_short_seconds: u64,
    #[serde(default = "default_timeout_medium")]
    pub timeout_medium_seconds: u64,
    #[serde(default = "default_timeout_long")]
    pub timeout_long_seconds: u64,
    #[serde(default = "default_timeout_heavy")]
    pub timeout_heavy_seconds: u64,
}

fn default_waveform_segments() -> usize {
    1000
}
fn default_topic_chunk_words() -> usize {
    300
}
fn default_timeout_short() -> u64 {
    60
}
fn default_timeout_medium() -> u64 {
    300
}
fn default_timeout_long() -> u64 {
    600
}
fn default_timeout_heavy() -> u64 {
    900
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            waveform_segments: default_waveform_segments(),
            topic_chunk_word_count: default_topic_chunk_words(),
            timeout_short_seconds: default_timeout_short(),
            timeout_medium_seconds: default_timeout_medium(),
            timeout_long_seconds: default_timeout_long(),
            timeout_heavy_seconds: default_timeout_heavy(),
        }
    }
}

/// Chat notification target. Disabled unless `realm` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZulipSettings {
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub bot_email: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_zulip_stream")]
    pub stream: String,
}

fn default_zulip_stream() -> String {
    "meetings".to_string()
}

impl Default for ZulipSettings {
    fn default() -> Self {
        Self {
            realm: None,
            bot_email: None,
            api_key: None,
            stream: default_zulip_stream(),
        }
    }
}

/// Completion webhook target. Disabled unless `url` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    #[serde(default)]
    pub url: Option<String>,
    /// Base64-encoded HMAC secret shared with the receiver.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
}

fn default_webhook_timeout() -> u64 {
    30
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            timeout_seconds: default_webhook_timeout(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port".into(),
                message: "port cannot be 0".into(),
            });
        }
        if self.storage.presigned_url_ttl_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "storage.presigned_url_ttl_seconds".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.pipeline.topic_chunk_word_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.topic_chunk_word_count".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.pipeline.waveform_segments == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.waveform_segments".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.llm.retry_network_attempts == 0 || self.llm.retry_parse_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "llm.retry_attempts".into(),
                message: "retry budgets must be at least 1".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::InvalidValue {
                field: "llm.temperature".into(),
                message: format!("must be between 0.0 and 2.0, got {}", self.llm.temperature),
            });
        }
        Ok(())
    }
}

/// Load settings from files and environment.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`REFLECTOR__` prefix, `__` separator)
/// 2. `config/{env}.*` (if env specified)
/// 3. `config/default.*`
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));
    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }
    builder = builder.add_source(
        Environment::with_prefix("REFLECTOR")
            .separator("__")
            .try_parsing(true),
    );

    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}
