//! End-to-end pipeline scenarios against real audio files, an in-memory
//! object store, an in-memory SQLite store, and scripted ASR/LLM fakes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use reflector_audio::{AudioFrame, WebmOpusWriter, OPUS_SAMPLE_RATE};
use reflector_config::Settings;
use reflector_core::{RecordingManifest, TrackEntry, Transcript, TranscriptStatus, Word};
use reflector_llm::{LanguageModel, LlmError};
use reflector_persistence::{ConsentStore, TaskCheckpoints, TranscriptStore};
use reflector_pipeline::{
    AsrError, MeetingPlatform, MultitrackPipeline, PipelineDeps, PlatformParticipant, ProgressBus,
    RecordingInfo, SpeechToText, StaticPlatform,
};
use reflector_storage::{MemoryStorage, ObjectStore};

const SOURCE_BUCKET: &str = "daily-recordings";
const TRANSCRIPT_BUCKET: &str = "reflector-transcripts";

/// Scripted transcription results keyed by a substring of the presigned URL,
/// with optional transient failures before the first success.
struct MockAsr {
    responses: Vec<(&'static str, Vec<Word>)>,
    transient_failures: Mutex<HashMap<&'static str, u32>>,
}

impl MockAsr {
    fn new(responses: Vec<(&'static str, Vec<Word>)>) -> Self {
        Self {
            responses,
            transient_failures: Mutex::new(HashMap::new()),
        }
    }

    async fn fail_transiently(&self, marker: &'static str, times: u32) {
        self.transient_failures.lock().await.insert(marker, times);
    }
}

#[async_trait]
impl SpeechToText for MockAsr {
    async fn transcribe(&self, audio_url: &str, _language: &str) -> Result<Vec<Word>, AsrError> {
        for (marker, words) in &self.responses {
            if audio_url.contains(marker) {
                let mut failures = self.transient_failures.lock().await;
                if let Some(remaining) = failures.get_mut(marker) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(AsrError::Transient("injected 503".to_string()));
                    }
                }
                return Ok(words.clone());
            }
        }
        Ok(Vec::new())
    }
}

/// Prompt-routed fake: each pipeline stage gets a recognizable answer.
/// `failing_chunk_marker` makes topic labelling fail schema validation for
/// chunks whose text contains the marker, simulating an exhausted parse
/// budget.
struct MockLlm {
    failing_chunk_marker: Option<&'static str>,
}

impl MockLlm {
    fn new() -> Self {
        Self {
            failing_chunk_marker: None,
        }
    }

    fn failing_topic_chunks(marker: &'static str) -> Self {
        Self {
            failing_chunk_marker: Some(marker),
        }
    }
}

#[async_trait]
impl LanguageModel for MockLlm {
    async fn complete(&self, prompt: &str, context: &[String]) -> Result<String, LlmError> {
        if prompt.contains("single short") {
            return Ok("Weekly Planning".to_string());
        }
        if prompt.contains("Get me information about the topic") {
            return Ok(format!("Detailed notes over {} chars.", context[0].len()));
        }
        if prompt.contains("Summarize the mentioned topic") {
            return Ok("One paragraph about this subject.".to_string());
        }
        if prompt.contains("quick recap") {
            return Ok("The team said hello across the meeting.".to_string());
        }
        Ok("ok".to_string())
    }

    async fn complete_structured(
        &self,
        _prompt: &str,
        context: &[String],
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let properties = &schema["properties"];
        if properties.get("subjects").is_some() {
            return Ok(serde_json::json!({"subjects": ["Greetings"]}));
        }
        if properties.get("decisions").is_some() {
            return Ok(serde_json::json!({
                "decisions": ["Keep meeting weekly"],
                "next_steps": ["Send the notes"],
            }));
        }
        // Topic chunk labelling.
        if let Some(marker) = self.failing_chunk_marker {
            if context[0].contains(marker) {
                return Err(LlmError::SchemaValidation(
                    "\"title\" is a required property (parse attempts exhausted)".to_string(),
                ));
            }
        }
        Ok(serde_json::json!({
            "title": "greetings exchanged",
            "summary": "Participants greeted each other.",
        }))
    }
}

/// A stereo sine tone at 48 kHz written as WebM/Opus; `start_offset_s`
/// shifts the first block the way late-joining platform tracks do.
fn write_tone_webm(path: &Path, duration_s: f64, start_offset_s: f64) {
    let mut writer =
        WebmOpusWriter::create_with_start(path, (start_offset_s * 1e9) as u64).unwrap();
    let frames = (duration_s * OPUS_SAMPLE_RATE as f64) as usize;
    let samples: Vec<f32> = (0..frames)
        .flat_map(|i| {
            let t = i as f32 / OPUS_SAMPLE_RATE as f32;
            let sample = (t * 440.0 * std::f32::consts::TAU).sin() * 0.3;
            [sample, sample]
        })
        .collect();
    writer.push(&AudioFrame::new(samples, OPUS_SAMPLE_RATE)).unwrap();
    writer.finish().unwrap();
}

struct Fixture {
    deps: Arc<PipelineDeps>,
    storage: Arc<MemoryStorage>,
    store: TranscriptStore,
    consent: ConsentStore,
    _data_dir: tempfile::TempDir,
}

async fn build_fixture(
    asr: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    platform: Arc<dyn MeetingPlatform>,
) -> Fixture {
    let data_dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.server.data_dir = data_dir.path().to_string_lossy().into_owned();
    settings.storage.transcript_bucket = TRANSCRIPT_BUCKET.to_string();
    settings.pipeline.waveform_segments = 50;

    let store = TranscriptStore::connect("sqlite::memory:").await.unwrap();
    let checkpoints = TaskCheckpoints::new(store.pool().clone());
    let consent = ConsentStore::new(store.pool().clone());
    let bus = ProgressBus::new(store.clone());
    let storage = Arc::new(MemoryStorage::new().unwrap());

    let deps = Arc::new(PipelineDeps {
        settings,
        store: store.clone(),
        checkpoints,
        consent: consent.clone(),
        storage: storage.clone(),
        bus,
        asr,
        llm,
        platform,
    });

    Fixture {
        deps,
        storage,
        store,
        consent,
        _data_dir: data_dir,
    }
}

async fn upload_tone(
    storage: &MemoryStorage,
    key: &str,
    duration_s: f64,
    start_offset_s: f64,
) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("track.webm");
    write_tone_webm(&path, duration_s, start_offset_s);
    storage
        .put_file(SOURCE_BUCKET, key, &path)
        .await
        .unwrap();
}

fn word(text: &str, start: f64, end: f64) -> Word {
    Word {
        text: text.to_string(),
        start,
        end,
        speaker: 0,
    }
}

fn two_track_platform() -> Arc<dyn MeetingPlatform> {
    Arc::new(
        StaticPlatform::new()
            .with_recording(RecordingInfo {
                id: "rec-1".into(),
                meeting_session_id: Some("mtg-1".into()),
                duration: 10.0,
            })
            .with_participants(
                "mtg-1",
                vec![
                    PlatformParticipant {
                        participant_id: "aaaa".into(),
                        user_name: Some("Alice".into()),
                        user_id: Some("u-alice".into()),
                    },
                    PlatformParticipant {
                        participant_id: "bbbb".into(),
                        user_name: Some("Bob".into()),
                        user_id: None,
                    },
                ],
            ),
    )
}

const TRACK_A: &str = "1000-aaaa-cam-audio-1000.webm";
const TRACK_B: &str = "1000-bbbb-cam-audio-9000.webm";

fn two_track_manifest(transcript_id: &str) -> RecordingManifest {
    RecordingManifest {
        recording_id: "rec-1".into(),
        bucket: SOURCE_BUCKET.into(),
        tracks: vec![
            TrackEntry {
                s3_key: TRACK_A.into(),
            },
            TrackEntry {
                s3_key: TRACK_B.into(),
            },
        ],
        transcript_id: transcript_id.into(),
        room_id: None,
    }
}

fn two_track_asr() -> MockAsr {
    MockAsr::new(vec![
        // Track a starts at meeting t=0 and is not re-uploaded.
        (
            "cam-audio-1000.webm",
            vec![word("Hello", 0.0, 0.5)],
        ),
        // Track b gets padded to meeting time before transcription.
        ("padded_1.webm", vec![word("World", 8.0, 8.5)]),
    ])
}

async fn seed_transcript(store: &TranscriptStore, id: &str) {
    let mut transcript = Transcript::new("Test meeting");
    transcript.id = id.to_string();
    store.create(transcript).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_tracks_staggered_join() {
    let fixture = build_fixture(
        Arc::new(two_track_asr()),
        Arc::new(MockLlm::new()),
        two_track_platform(),
    )
    .await;
    upload_tone(&fixture.storage, TRACK_A, 5.0, 0.0).await;
    upload_tone(&fixture.storage, TRACK_B, 2.0, 8.0).await;
    seed_transcript(&fixture.store, "t1").await;

    let pipeline = MultitrackPipeline::new(fixture.deps.clone());
    pipeline.run(&two_track_manifest("t1")).await.unwrap();

    let transcript = fixture.store.get_by_id("t1").await.unwrap().unwrap();
    assert_eq!(transcript.status, TranscriptStatus::Ended);
    assert!(transcript.workflow_run_id.is_none());

    // Speaker bijection with the manifest's track order.
    assert_eq!(transcript.participants.len(), 2);
    assert_eq!(transcript.participants[0].name, "Alice");
    assert_eq!(transcript.participants[0].speaker, 0);
    assert_eq!(transcript.participants[1].name, "Bob");
    assert_eq!(transcript.participants[1].speaker, 1);

    // Merged timeline: Hello at t=0 from speaker 0, World at t=8 from
    // speaker 1.
    assert_eq!(transcript.topics.len(), 1);
    let words = &transcript.topics[0].words;
    assert_eq!(words.len(), 2);
    assert_eq!(words[0].text, "Hello");
    assert_eq!(words[0].speaker, 0);
    assert!(words[0].start.abs() < 0.1);
    assert_eq!(words[1].text, "World");
    assert_eq!(words[1].speaker, 1);
    assert!((words[1].start - 8.0).abs() < 0.1);

    // Mixed audio covers the padded track: ~10s.
    assert!((transcript.duration - 10000.0).abs() <= 30.0, "duration={}", transcript.duration);

    // Title from the LLM, casing fallback applied to topics.
    assert_eq!(transcript.title.as_deref(), Some("Weekly Planning"));
    assert_eq!(transcript.topics[0].title, "Greetings Exchanged");
    assert!(transcript.long_summary.as_deref().unwrap().starts_with("# Quick recap"));
    assert_eq!(
        transcript.action_items.as_ref().unwrap().decisions,
        vec!["Keep meeting weekly"]
    );

    // Event stream: starts processing, ends ended, every uid unique.
    let kinds: Vec<&str> = transcript.events.iter().map(|e| e.payload.kind()).collect();
    assert_eq!(kinds.first(), Some(&"STATUS"));
    assert_eq!(kinds.last(), Some(&"STATUS"));
    for kind in ["TOPIC", "FINAL_TITLE", "FINAL_SHORT_SUMMARY", "FINAL_LONG_SUMMARY", "ACTION_ITEMS", "TRANSCRIPT", "DURATION", "WAVEFORM"] {
        assert!(kinds.contains(&kind), "missing {kind} in {kinds:?}");
    }
    let mut uids: Vec<&str> = transcript.events.iter().map(|e| e.uid.as_str()).collect();
    uids.sort();
    uids.dedup();
    assert_eq!(uids.len(), transcript.events.len());

    // Finalize removed the temporary padded blob; the mixed MP3 stays.
    let keys = fixture.storage.keys(TRANSCRIPT_BUCKET).await;
    assert!(keys.iter().all(|k| !k.starts_with("tmp/")), "leftover: {keys:?}");
    assert!(keys.contains(&"t1/audio.mp3".to_string()));

    // Waveform persisted with the configured segment count.
    let waveform_path = Path::new(&fixture.deps.settings.server.data_dir)
        .join("t1")
        .join("audio.json");
    let waveform: Vec<f32> =
        serde_json::from_slice(&std::fs::read(waveform_path).unwrap()).unwrap();
    assert_eq!(waveform.len(), 50);
    assert!(waveform.iter().any(|&p| p > 0.1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_track_zero_offset_reuses_source_object() {
    let asr = MockAsr::new(vec![(
        "cam-audio",
        vec![word("Hi", 0.2, 0.6), word("there", 0.7, 1.1)],
    )]);
    let platform = Arc::new(
        StaticPlatform::new().with_recording(RecordingInfo {
            id: "rec-2".into(),
            meeting_session_id: None,
            duration: 3.0,
        }),
    );
    let fixture = build_fixture(Arc::new(asr), Arc::new(MockLlm::new()), platform).await;

    let key = "2000-cccc-cam-audio-2000.webm";
    upload_tone(&fixture.storage, key, 3.0, 0.0).await;
    seed_transcript(&fixture.store, "t2").await;

    let manifest = RecordingManifest {
        recording_id: "rec-2".into(),
        bucket: SOURCE_BUCKET.into(),
        tracks: vec![TrackEntry { s3_key: key.into() }],
        transcript_id: "t2".into(),
        room_id: None,
    };
    MultitrackPipeline::new(fixture.deps.clone())
        .run(&manifest)
        .await
        .unwrap();

    let transcript = fixture.store.get_by_id("t2").await.unwrap().unwrap();
    assert_eq!(transcript.status, TranscriptStatus::Ended);
    assert!((transcript.duration - 3000.0).abs() <= 30.0);

    // No session roster: fallback speaker naming, one seat per track.
    assert_eq!(transcript.participants.len(), 1);
    assert_eq!(transcript.participants[0].name, "Speaker 0");

    // Zero offset means no padded upload ever happened.
    let keys = fixture.storage.keys(TRANSCRIPT_BUCKET).await;
    assert_eq!(keys, vec!["t2/audio.mp3".to_string()]);
    assert!(fixture.storage.contains(SOURCE_BUCKET, key).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_asr_transient_failure_retries_clean() {
    let asr = two_track_asr();
    asr.fail_transiently("cam-audio-1000.webm", 1).await;
    let fixture = build_fixture(
        Arc::new(asr),
        Arc::new(MockLlm::new()),
        two_track_platform(),
    )
    .await;
    upload_tone(&fixture.storage, TRACK_A, 5.0, 0.0).await;
    upload_tone(&fixture.storage, TRACK_B, 2.0, 8.0).await;
    seed_transcript(&fixture.store, "t3").await;

    MultitrackPipeline::new(fixture.deps.clone())
        .run(&two_track_manifest("t3"))
        .await
        .unwrap();

    let transcript = fixture.store.get_by_id("t3").await.unwrap().unwrap();
    assert_eq!(transcript.status, TranscriptStatus::Ended);

    // The retried transcription produced no duplicate topic events.
    let topic_events = transcript
        .events
        .iter()
        .filter(|e| e.payload.kind() == "TOPIC")
        .count();
    assert_eq!(topic_events, transcript.topics.len());
    assert_eq!(transcript.topics.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_topic_chunk_parse_exhaustion_fails_pipeline() {
    let fixture = build_fixture(
        Arc::new(two_track_asr()),
        Arc::new(MockLlm::failing_topic_chunks("World")),
        two_track_platform(),
    )
    .await;
    upload_tone(&fixture.storage, TRACK_A, 5.0, 0.0).await;
    upload_tone(&fixture.storage, TRACK_B, 2.0, 8.0).await;
    seed_transcript(&fixture.store, "t4").await;

    let result = MultitrackPipeline::new(fixture.deps.clone())
        .run(&two_track_manifest("t4"))
        .await;
    assert!(result.is_err());

    let transcript = fixture.store.get_by_id("t4").await.unwrap().unwrap();
    assert_eq!(transcript.status, TranscriptStatus::Error);

    // Earlier events survive; nothing downstream of the failure ran.
    assert!(transcript
        .events
        .iter()
        .any(|e| e.uid == "status:processing"));
    assert!(!transcript
        .events
        .iter()
        .any(|e| e.payload.kind() == "FINAL_TITLE"));
    assert!(!transcript
        .events
        .iter()
        .any(|e| e.payload.kind() == "DURATION"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consent_denied_deletes_audio() {
    let fixture = build_fixture(
        Arc::new(two_track_asr()),
        Arc::new(MockLlm::new()),
        two_track_platform(),
    )
    .await;
    upload_tone(&fixture.storage, TRACK_A, 5.0, 0.0).await;
    upload_tone(&fixture.storage, TRACK_B, 2.0, 8.0).await;

    let mut transcript = Transcript::new("Consent meeting");
    transcript.id = "t5".to_string();
    transcript.meeting_id = Some("m5".to_string());
    fixture.store.create(transcript).await.unwrap();
    fixture.consent.record("m5", "bbbb", false).await.unwrap();

    MultitrackPipeline::new(fixture.deps.clone())
        .run(&two_track_manifest("t5"))
        .await
        .unwrap();

    let transcript = fixture.store.get_by_id("t5").await.unwrap().unwrap();
    // Cleanup happens after finalize; the run itself still ended.
    assert_eq!(transcript.status, TranscriptStatus::Ended);
    assert!(transcript.audio_deleted);

    assert!(!fixture.storage.contains(SOURCE_BUCKET, TRACK_A).await);
    assert!(!fixture.storage.contains(SOURCE_BUCKET, TRACK_B).await);
    assert!(
        !fixture
            .storage
            .contains(TRANSCRIPT_BUCKET, "t5/audio.mp3")
            .await
    );
    // The derived transcript itself is retained.
    assert_eq!(transcript.topics.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rerun_is_idempotent() {
    let fixture = build_fixture(
        Arc::new(two_track_asr()),
        Arc::new(MockLlm::new()),
        two_track_platform(),
    )
    .await;
    upload_tone(&fixture.storage, TRACK_A, 5.0, 0.0).await;
    upload_tone(&fixture.storage, TRACK_B, 2.0, 8.0).await;
    seed_transcript(&fixture.store, "t6").await;

    let pipeline = MultitrackPipeline::new(fixture.deps.clone());
    pipeline.run(&two_track_manifest("t6")).await.unwrap();
    let first = fixture.store.get_by_id("t6").await.unwrap().unwrap();

    pipeline.run(&two_track_manifest("t6")).await.unwrap();
    let second = fixture.store.get_by_id("t6").await.unwrap().unwrap();

    assert_eq!(first.duration, second.duration);
    assert_eq!(first.participants, second.participants);
    assert_eq!(
        first.topics.iter().map(|t| &t.title).collect::<Vec<_>>(),
        second.topics.iter().map(|t| &t.title).collect::<Vec<_>>()
    );
    assert_eq!(second.status, TranscriptStatus::Ended);
    // The title set by the first run survives the second.
    assert_eq!(second.title.as_deref(), Some("Weekly Planning"));
}
