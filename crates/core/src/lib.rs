//! Core domain types shared across the Reflector workspace.
//!
//! Everything here is plain data: words, topics, participants, the transcript
//! aggregate, progress events, and the recording manifest that kicks off a
//! pipeline run. No I/O lives in this crate.

mod events;
mod manifest;
mod types;

pub use events::{ProgressEvent, TranscriptEvent};
pub use manifest::{
    filter_cam_audio_tracks, is_cam_audio_track, parse_track_key, ManifestError, ParsedTrackKey,
    RecordingManifest, TrackEntry,
};
pub use types::{
    words_as_segments, ActionItems, AudioLocation, Participant, Segment, Topic, Transcript,
    TranscriptStatus, Word,
};

/// Join word texts with single spaces, the canonical transcript text form.
pub fn words_text(words: &[Word]) -> String {
    words
        .iter()
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}
