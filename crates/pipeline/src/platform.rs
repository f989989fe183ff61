//! Meeting platform boundary: recording metadata and the participant roster.
//!
//! The conferencing platform is external to the core; the pipeline only needs
//! two lookups from it. `StaticPlatform` serves both from data supplied at
//! enqueue time (and is what the tests drive).

use std::collections::HashMap;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("recording not found: {0}")]
    RecordingNotFound(String),
    #[error("meeting session not found: {0}")]
    SessionNotFound(String),
    #[error("platform error: {0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct RecordingInfo {
    pub id: String,
    pub meeting_session_id: Option<String>,
    /// Seconds, as reported by the platform.
    pub duration: f64,
}

#[derive(Debug, Clone)]
pub struct PlatformParticipant {
    pub participant_id: String,
    pub user_name: Option<String>,
    pub user_id: Option<String>,
}

#[async_trait]
pub trait MeetingPlatform: Send + Sync {
    async fn get_recording(&self, recording_id: &str) -> Result<RecordingInfo, PlatformError>;

    async fn get_meeting_participants(
        &self,
        meeting_session_id: &str,
    ) -> Result<Vec<PlatformParticipant>, PlatformError>;
}

/// Fixed recording metadata and roster.
#[derive(Debug, Clone, Default)]
pub struct StaticPlatform {
    recordings: HashMap<String, RecordingInfo>,
    participants: HashMap<String, Vec<PlatformParticipant>>,
}

impl StaticPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recording(mut self, info: RecordingInfo) -> Self {
        self.recordings.insert(info.id.clone(), info);
        self
    }

    pub fn with_participants(
        mut self,
        meeting_session_id: &str,
        participants: Vec<PlatformParticipant>,
    ) -> Self {
        self.participants
            .insert(meeting_session_id.to_string(), participants);
        self
    }
}

/// Fallback when no conferencing API is configured: recording metadata is
/// echoed back with no session, and the roster is empty (participants fall
/// back to `Speaker {i}` names).
#[derive(Debug, Clone, Default)]
pub struct NullPlatform;

#[async_trait]
impl MeetingPlatform for NullPlatform {
    async fn get_recording(&self, recording_id: &str) -> Result<RecordingInfo, PlatformError> {
        Ok(RecordingInfo {
            id: recording_id.to_string(),
            meeting_session_id: None,
            duration: 0.0,
        })
    }

    async fn get_meeting_participants(
        &self,
        _meeting_session_id: &str,
    ) -> Result<Vec<PlatformParticipant>, PlatformError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl MeetingPlatform for StaticPlatform {
    async fn get_recording(&self, recording_id: &str) -> Result<RecordingInfo, PlatformError> {
        self.recordings
            .get(recording_id)
            .cloned()
            .ok_or_else(|| PlatformError::RecordingNotFound(recording_id.to_string()))
    }

    async fn get_meeting_participants(
        &self,
        meeting_session_id: &str,
    ) -> Result<Vec<PlatformParticipant>, PlatformError> {
        Ok(self
            .participants
            .get(meeting_session_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_platform_lookup() {
        let platform = StaticPlatform::new()
            .with_recording(RecordingInfo {
                id: "rec".into(),
                meeting_session_id: Some("mtg".into()),
                duration: 12.5,
            })
            .with_participants(
                "mtg",
                vec![PlatformParticipant {
                    participant_id: "p1".into(),
                    user_name: Some("Ada".into()),
                    user_id: None,
                }],
            );

        let rec = platform.get_recording("rec").await.unwrap();
        assert_eq!(rec.duration, 12.5);
        let roster = platform.get_meeting_participants("mtg").await.unwrap();
        assert_eq!(roster[0].user_name.as_deref(), Some("Ada"));
        assert!(platform.get_recording("other").await.is_err());
    }
}
