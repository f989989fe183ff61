//! Per-track and per-chunk child workflows: padding, transcription, topic
//! labelling, and the word-merge/chunking helpers between them.

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use reflector_audio::{pad_with_silence, MediaInput};
use reflector_core::{words_text, Topic, Word};
use reflector_llm::LanguageModel;
use reflector_storage::PresignOperation;

use crate::multitrack::PipelineDeps;
use crate::summary::{ensure_casing, topic_schema, TOPIC_PROMPT};
use crate::PipelineError;

/// Output of the padding subflow. When the source starts at meeting t=0 the
/// original object is reused and nothing is uploaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaddedTrack {
    pub track_index: usize,
    pub padded_key: String,
    pub bucket: String,
    pub size: u64,
    pub was_padded: bool,
}

/// Pad one track with silence equal to its meeting-start offset and upload
/// the padded artifact under `tmp/{transcript_id}/tracks/`.
///
/// A failed padding fails the whole pipeline: mis-aligned tracks would
/// silently corrupt the merged timeline, which is worse than a visible
/// error.
pub async fn pad_track(
    deps: &PipelineDeps,
    transcript_id: &str,
    track_index: usize,
    source_bucket: &str,
    s3_key: &str,
) -> Result<PaddedTrack, PipelineError> {
    let ttl = deps.presign_ttl();
    let source_url = deps
        .storage
        .presigned_url(source_bucket, s3_key, PresignOperation::Get, ttl)
        .await?;

    let padded = tokio::task::spawn_blocking(
        move || -> Result<(f64, Option<tempfile::TempPath>), PipelineError> {
            let mut input = MediaInput::open(&source_url)?;
            let offset_s = input.start_offset_s();
            if offset_s <= 0.0 {
                return Ok((offset_s, None));
            }
            let temp = tempfile::Builder::new().suffix(".webm").tempfile()?;
            let temp_path = temp.into_temp_path();
            pad_with_silence(&mut input, &temp_path, offset_s)?;
            Ok((offset_s, Some(temp_path)))
        },
    )
    .await??;

    match padded {
        (offset_s, None) => {
            tracing::info!(
                track_index,
                offset_s,
                "track requires no padding, reusing source object"
            );
            let info = deps.storage.head(source_bucket, s3_key).await?;
            Ok(PaddedTrack {
                track_index,
                padded_key: s3_key.to_string(),
                bucket: source_bucket.to_string(),
                size: info.size.unwrap_or(0),
                was_padded: false,
            })
        }
        (offset_s, Some(temp_path)) => {
            let padded_key = format!("tmp/{transcript_id}/tracks/padded_{track_index}.webm");
            let bucket = deps.settings.storage.transcript_bucket.clone();
            let size = std::fs::metadata(&temp_path)?.len();
            deps.storage
                .put_file(&bucket, &padded_key, &temp_path)
                .await?;
            tracing::info!(track_index, offset_s, size, key = %padded_key, "padded track uploaded");
            Ok(PaddedTrack {
                track_index,
                padded_key,
                bucket,
                size,
                was_padded: true,
            })
        }
    }
}

/// Transcribe one padded track. Timestamps come back track-local, which is
/// already meeting-global because the padded track begins at meeting t=0;
/// only the speaker tag is rewritten.
pub async fn transcribe_track(
    deps: &PipelineDeps,
    track: &PaddedTrack,
    language: &str,
) -> Result<Vec<Word>, PipelineError> {
    let url = deps
        .storage
        .presigned_url(
            &track.bucket,
            &track.padded_key,
            PresignOperation::Get,
            deps.presign_ttl(),
        )
        .await?;
    let mut words = deps.asr.transcribe(&url, language).await?;
    for word in &mut words {
        word.speaker = track.track_index;
    }
    tracing::info!(
        track_index = track.track_index,
        words = words.len(),
        "track transcribed"
    );
    Ok(words)
}

/// Concatenate per-track word lists in track order and stable-sort by start
/// time, so equal timestamps keep their track-index grouping.
pub fn merge_track_words(per_track: Vec<Vec<Word>>) -> Vec<Word> {
    let mut all: Vec<Word> = per_track.into_iter().flatten().collect();
    all.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(Ordering::Equal));
    all
}

/// A fixed-size window of consecutive words submitted to the LLM for one
/// topic label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicChunk {
    pub chunk_index: usize,
    pub text: String,
    pub timestamp: f64,
    pub duration: f64,
    pub words: Vec<Word>,
}

pub fn chunk_words(words: &[Word], chunk_size: usize) -> Vec<TopicChunk> {
    words
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(chunk_index, chunk)| {
            let first = &chunk[0];
            let last = &chunk[chunk.len() - 1];
            TopicChunk {
                chunk_index,
                text: words_text(chunk),
                timestamp: first.start,
                duration: last.end - first.start,
                words: chunk.to_vec(),
            }
        })
        .collect()
}

/// Label one chunk with `{title, summary}`; the title gets the casing
/// fallback applied.
pub async fn label_topic_chunk(
    llm: &dyn LanguageModel,
    transcript_id: &str,
    chunk: &TopicChunk,
) -> Result<Topic, PipelineError> {
    let value = llm
        .complete_structured(TOPIC_PROMPT, &[chunk.text.clone()], &topic_schema())
        .await?;

    #[derive(Deserialize)]
    struct TitleSummary {
        title: String,
        summary: String,
    }
    let parsed: TitleSummary = serde_json::from_value(value)?;

    Ok(Topic {
        // Deterministic per transcript and chunk so retries upsert in place.
        id: format!("{transcript_id}-topic-{}", chunk.chunk_index),
        title: ensure_casing(&parsed.title),
        summary: parsed.summary,
        timestamp: chunk.timestamp,
        duration: chunk.duration,
        transcript: Some(chunk.text.clone()),
        words: chunk.words.clone(),
    })
}

impl PipelineDeps {
    pub(crate) fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.storage.presigned_url_ttl_seconds)
    }
}
