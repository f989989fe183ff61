//! Progress events appended to the transcript event log and broadcast to
//! WebSocket subscribers.

use serde::{Deserialize, Serialize};

use crate::types::{ActionItems, Topic, TranscriptStatus};

/// Wire payload, one JSON object per event: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ProgressEvent {
    #[serde(rename = "STATUS")]
    Status { value: TranscriptStatus },
    #[serde(rename = "TOPIC")]
    Topic(Topic),
    #[serde(rename = "FINAL_TITLE")]
    FinalTitle { title: String },
    #[serde(rename = "FINAL_SHORT_SUMMARY")]
    FinalShortSummary { short_summary: String },
    #[serde(rename = "FINAL_LONG_SUMMARY")]
    FinalLongSummary { long_summary: String },
    #[serde(rename = "ACTION_ITEMS")]
    ActionItems { action_items: ActionItems },
    #[serde(rename = "TRANSCRIPT")]
    Transcript {
        text: String,
        translation: Option<String>,
    },
    /// Milliseconds.
    #[serde(rename = "DURATION")]
    Duration { duration: f64 },
    #[serde(rename = "WAVEFORM")]
    Waveform { waveform: Vec<f32> },
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Status { .. } => "STATUS",
            ProgressEvent::Topic(_) => "TOPIC",
            ProgressEvent::FinalTitle { .. } => "FINAL_TITLE",
            ProgressEvent::FinalShortSummary { .. } => "FINAL_SHORT_SUMMARY",
            ProgressEvent::FinalLongSummary { .. } => "FINAL_LONG_SUMMARY",
            ProgressEvent::ActionItems { .. } => "ACTION_ITEMS",
            ProgressEvent::Transcript { .. } => "TRANSCRIPT",
            ProgressEvent::Duration { .. } => "DURATION",
            ProgressEvent::Waveform { .. } => "WAVEFORM",
        }
    }
}

/// A persisted event: the wire payload plus a uid that makes re-appends from
/// replayed tasks no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub uid: String,
    #[serde(flatten)]
    pub payload: ProgressEvent,
}

impl TranscriptEvent {
    pub fn new(uid: impl Into<String>, payload: ProgressEvent) -> Self {
        Self {
            uid: uid.into(),
            payload,
        }
    }
}
