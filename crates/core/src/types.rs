//! Transcript aggregate and its parts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::TranscriptEvent;

/// A single transcribed word with meeting-global timestamps in seconds.
///
/// Padded tracks begin at meeting t=0, so ASR timestamps need no further
/// shifting; `speaker` equals the track index the word came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub speaker: usize,
}

/// One topic-labelled window of the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    #[serde(default = "new_id")]
    pub id: String,
    pub title: String,
    pub summary: String,
    /// First word's start, seconds.
    pub timestamp: f64,
    /// Last word's end minus `timestamp`, seconds.
    #[serde(default)]
    pub duration: f64,
    /// Plain text of the window, words joined by spaces.
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub words: Vec<Word>,
}

/// A meeting participant; `speaker` is the track index and is unique per
/// transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub speaker: usize,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Decisions and next steps extracted by the LLM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionItems {
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptStatus {
    #[default]
    Idle,
    Processing,
    Ended,
    Error,
}

impl TranscriptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptStatus::Idle => "idle",
            TranscriptStatus::Processing => "processing",
            TranscriptStatus::Ended => "ended",
            TranscriptStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioLocation {
    #[default]
    Local,
    Storage,
}

/// A run of consecutive words by one speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub speaker: usize,
    pub text: String,
    pub timestamp: f64,
}

/// Collapse a word list into per-speaker segments, preserving order.
pub fn words_as_segments(words: &[Word]) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    for word in words {
        match segments.last_mut() {
            Some(seg) if seg.speaker == word.speaker => {
                seg.text.push(' ');
                seg.text.push_str(&word.text);
            }
            _ => segments.push(Segment {
                speaker: word.speaker,
                text: word.text.clone(),
                timestamp: word.start,
            }),
        }
    }
    segments
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_name() -> String {
    format!("Transcript {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))
}

/// The transcript aggregate owned by the store.
///
/// `events` is append-only; its order is the database commit order and is the
/// order subscribers observe on the progress bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub status: TranscriptStatus,
    /// Duration of the mixed audio, milliseconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub short_summary: Option<String>,
    #[serde(default)]
    pub long_summary: Option<String>,
    #[serde(default)]
    pub action_items: Option<ActionItems>,
    #[serde(default)]
    pub topics: Vec<Topic>,
    #[serde(default)]
    pub events: Vec<TranscriptEvent>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default = "default_language")]
    pub source_language: String,
    #[serde(default = "default_language")]
    pub target_language: String,
    #[serde(default)]
    pub audio_location: AudioLocation,
    #[serde(default)]
    pub audio_deleted: bool,
    #[serde(default)]
    pub meeting_id: Option<String>,
    #[serde(default)]
    pub recording_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub zulip_message_id: Option<i64>,
}

fn default_language() -> String {
    "en".to_string()
}

impl Transcript {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            status: TranscriptStatus::Idle,
            duration: 0.0,
            created_at: Utc::now(),
            title: None,
            short_summary: None,
            long_summary: None,
            action_items: None,
            topics: Vec::new(),
            events: Vec::new(),
            participants: Vec::new(),
            source_language: default_language(),
            target_language: default_language(),
            audio_location: AudioLocation::Local,
            audio_deleted: false,
            meeting_id: None,
            recording_id: None,
            room_id: None,
            workflow_run_id: None,
            zulip_message_id: None,
        }
    }

    /// Append an event unless one with the same uid is already present.
    /// Returns the appended event, or `None` on a duplicate uid.
    pub fn add_event(&mut self, event: TranscriptEvent) -> Option<&TranscriptEvent> {
        if self.events.iter().any(|e| e.uid == event.uid) {
            return None;
        }
        self.events.push(event);
        self.events.last()
    }

    /// Replace the topic with the same id, or append.
    pub fn upsert_topic(&mut self, topic: Topic) {
        match self.topics.iter_mut().find(|t| t.id == topic.id) {
            Some(slot) => *slot = topic,
            None => self.topics.push(topic),
        }
    }

    /// Replace the participant with the same id, or append.
    pub fn upsert_participant(&mut self, participant: Participant) {
        match self.participants.iter_mut().find(|p| p.id == participant.id) {
            Some(slot) => *slot = participant,
            None => self.participants.push(participant),
        }
    }

    pub fn delete_participant(&mut self, participant_id: &str) {
        self.participants.retain(|p| p.id != participant_id);
    }

    /// Object key of the mixed audio inside the transcript bucket.
    pub fn storage_audio_path(&self) -> String {
        format!("{}/audio.mp3", self.id)
    }

    /// Object key prefix for temporary padded tracks of this transcript.
    pub fn padded_track_key(&self, track_index: usize) -> String {
        format!("tmp/{}/tracks/padded_{}.webm", self.id, track_index)
    }

    /// Collapse all topic words into per-speaker display lines using
    /// participant names, `Speaker {i}` when a seat has no name.
    pub fn speaker_lines(&self, words: &[Word]) -> Vec<String> {
        words_as_segments(words)
            .into_iter()
            .map(|seg| {
                let name = self
                    .participants
                    .iter()
                    .find(|p| p.speaker == seg.speaker)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| format!("Speaker {}", seg.speaker));
                format!("{}: {}", name, seg.text)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProgressEvent;

    fn word(text: &str, start: f64, end: f64, speaker: usize) -> Word {
        Word {
            text: text.to_string(),
            start,
            end,
            speaker,
        }
    }

    #[test]
    fn test_segments_group_consecutive_speakers() {
        let words = vec![
            word("hello", 0.0, 0.4, 0),
            word("there", 0.5, 0.9, 0),
            word("hi", 1.0, 1.2, 1),
            word("back", 1.3, 1.6, 0),
        ];
        let segments = words_as_segments(&words);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].text, "hello there");
        assert_eq!(segments[0].speaker, 0);
        assert_eq!(segments[1].text, "hi");
        assert_eq!(segments[2].text, "back");
        assert_eq!(segments[0].timestamp, 0.0);
    }

    #[test]
    fn test_add_event_dedupes_by_uid() {
        let mut transcript = Transcript::new("t");
        let ev = TranscriptEvent::new(
            "finalize:duration",
            ProgressEvent::Duration { duration: 1000.0 },
        );
        assert!(transcript.add_event(ev.clone()).is_some());
        assert!(transcript.add_event(ev).is_none());
        assert_eq!(transcript.events.len(), 1);
    }

    #[test]
    fn test_upsert_topic_replaces_by_id() {
        let mut transcript = Transcript::new("t");
        let mut topic = Topic {
            id: "a".into(),
            title: "First".into(),
            summary: "s".into(),
            timestamp: 0.0,
            duration: 1.0,
            transcript: None,
            words: vec![],
        };
        transcript.upsert_topic(topic.clone());
        topic.title = "Second".into();
        transcript.upsert_topic(topic);
        assert_eq!(transcript.topics.len(), 1);
        assert_eq!(transcript.topics[0].title, "Second");
    }

    #[test]
    fn test_speaker_lines_use_participant_names() {
        let mut transcript = Transcript::new("t");
        transcript.upsert_participant(Participant {
            id: "p0".into(),
            speaker: 0,
            name: "Ada".into(),
            user_id: None,
        });
        let lines = transcript.speaker_lines(&[word("hello", 0.0, 0.5, 0), word("hi", 1.0, 1.5, 1)]);
        assert_eq!(lines, vec!["Ada: hello", "Speaker 1: hi"]);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TranscriptStatus::Processing).unwrap(),
            "\"processing\""
        );
    }
}
