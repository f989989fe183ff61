//! The multitrack post-processing pipeline.
//!
//! A recording manifest goes in; a finished transcript comes out: padded
//! tracks, per-track transcription, a mixed MP3, a waveform, topic chunks,
//! title, summaries, action items, consent cleanup, and notifications —
//! with progress broadcast per transcript and durable task checkpoints that
//! survive worker crashes.

pub mod asr;
pub mod multitrack;
pub mod notify;
pub mod platform;
pub mod progress;
pub mod runner;
pub mod subflows;
pub mod summary;

pub use asr::{AsrError, HttpAsr, SpeechToText};
pub use multitrack::{MultitrackPipeline, PipelineDeps};
pub use platform::{
    MeetingPlatform, NullPlatform, PlatformError, PlatformParticipant, RecordingInfo,
    StaticPlatform,
};
pub use progress::ProgressBus;
pub use runner::{TaskPolicy, TaskRunner};

use reflector_audio::AudioError;
use reflector_core::ManifestError;
use reflector_llm::LlmError;
use reflector_persistence::PersistenceError;
use reflector_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Asr(#[from] AsrError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("task {task} timed out after {seconds}s")]
    Timeout { task: String, seconds: u64 },
    #[error("{0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Task(format!("worker task died: {err}"))
    }
}
