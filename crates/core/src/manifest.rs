//! Recording manifest: the input that starts a pipeline run, plus helpers for
//! the platform's track key naming scheme.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest has no tracks")]
    NoTracks,
    #[error("track key is not a cam-audio recording: {0}")]
    NotCamAudio(String),
    #[error("malformed track key: {0}")]
    MalformedTrackKey(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntry {
    pub s3_key: String,
}

/// Immutable for the life of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingManifest {
    pub recording_id: String,
    pub bucket: String,
    pub tracks: Vec<TrackEntry>,
    pub transcript_id: String,
    #[serde(default)]
    pub room_id: Option<String>,
}

impl RecordingManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.tracks.is_empty() {
            return Err(ManifestError::NoTracks);
        }
        Ok(())
    }

    pub fn track_keys(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.s3_key.clone()).collect()
    }
}

const CAM_AUDIO_MARKER: &str = "-cam-audio-";

/// Per-participant audio tracks carry a `cam-audio` marker; screen shares and
/// video tracks do not and are excluded from processing.
pub fn is_cam_audio_track(key: &str) -> bool {
    key.contains(CAM_AUDIO_MARKER)
}

pub fn filter_cam_audio_tracks<S: AsRef<str>>(keys: &[S]) -> Vec<String> {
    keys.iter()
        .map(|k| k.as_ref())
        .filter(|k| is_cam_audio_track(k))
        .map(|k| k.to_string())
        .collect()
}

/// Parsed form of
/// `{recording_start_ms}-{participant_id}-cam-audio-{track_start_ms}.webm`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTrackKey {
    pub recording_started_ms: u64,
    pub participant_id: String,
    pub track_started_ms: u64,
}

pub fn parse_track_key(key: &str) -> Result<ParsedTrackKey, ManifestError> {
    let filename = key.rsplit('/').next().unwrap_or(key);
    let stem = filename
        .strip_suffix(".webm")
        .ok_or_else(|| ManifestError::MalformedTrackKey(key.to_string()))?;

    let (left, track_ts) = stem
        .split_once(CAM_AUDIO_MARKER)
        .ok_or_else(|| ManifestError::NotCamAudio(key.to_string()))?;
    let (rec_ts, participant_id) = left
        .split_once('-')
        .ok_or_else(|| ManifestError::MalformedTrackKey(key.to_string()))?;

    if participant_id.is_empty() {
        return Err(ManifestError::MalformedTrackKey(key.to_string()));
    }

    let recording_started_ms = rec_ts
        .parse()
        .map_err(|_| ManifestError::MalformedTrackKey(key.to_string()))?;
    let track_started_ms = track_ts
        .parse()
        .map_err(|_| ManifestError::MalformedTrackKey(key.to_string()))?;

    Ok(ParsedTrackKey {
        recording_started_ms,
        participant_id: participant_id.to_string(),
        track_started_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str =
        "rooms/demo/1760988935484-52f7f48b-fbab-431f-9a50-87b9abfc8255-cam-audio-1760988935922.webm";

    #[test]
    fn test_parse_track_key() {
        let parsed = parse_track_key(KEY).unwrap();
        assert_eq!(parsed.recording_started_ms, 1760988935484);
        assert_eq!(parsed.participant_id, "52f7f48b-fbab-431f-9a50-87b9abfc8255");
        assert_eq!(parsed.track_started_ms, 1760988935922);
    }

    #[test]
    fn test_parse_rejects_screen_share() {
        let err = parse_track_key("1760988935484-abc-screen-video-1760988935922.webm");
        assert!(matches!(err, Err(ManifestError::NotCamAudio(_))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_track_key("notatrack.webm").is_err());
        assert!(parse_track_key("x-cam-audio-y.webm").is_err());
    }

    #[test]
    fn test_filter_cam_audio() {
        let keys = vec![
            KEY.to_string(),
            "1-abc-screen-video-2.webm".to_string(),
        ];
        let filtered = filter_cam_audio_tracks(&keys);
        assert_eq!(filtered, vec![KEY.to_string()]);
    }

    #[test]
    fn test_manifest_validation() {
        let manifest = RecordingManifest {
            recording_id: "rec".into(),
            bucket: "daily-recordings".into(),
            tracks: vec![],
            transcript_id: "tid".into(),
            room_id: None,
        };
        assert!(matches!(manifest.validate(), Err(ManifestError::NoTracks)));
    }
}
