//! The root workflow: manifest in, finished transcript out.
//!
//! Control flow:
//! `get_recording → get_participants → process_paddings →
//! { process_transcriptions, mixdown_tracks } →
//! { detect_topics, generate_waveform } →
//! { generate_title, extract_subjects → process_subjects → generate_recap,
//!   identify_action_items } → finalize → cleanup_consent →
//! { post_notification, send_webhook }`.
//!
//! Track count, chunk count, and subject count drive the fan-outs at
//! runtime; each join is a `JoinSet` over child futures. Tasks checkpoint
//! their outputs, so re-driving a run after a worker crash resumes where it
//! stopped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use uuid::Uuid;

use reflector_config::Settings;
use reflector_core::{
    filter_cam_audio_tracks, parse_track_key, ActionItems, AudioLocation, Participant,
    ProgressEvent, RecordingManifest, Topic, TranscriptStatus, Word,
};
use reflector_llm::LanguageModel;
use reflector_persistence::{ConsentStore, TaskCheckpoints, TranscriptStore};
use reflector_storage::{ObjectStore, PresignOperation};

use crate::asr::SpeechToText;
use crate::notify;
use crate::platform::MeetingPlatform;
use crate::progress::{append_event_and_broadcast, set_status_and_broadcast, ProgressBus};
use crate::runner::{TaskPolicy, TaskRunner};
use crate::subflows::{
    chunk_words, label_topic_chunk, merge_track_words, pad_track, transcribe_track, PaddedTrack,
};
use crate::summary::{self, SubjectSummary, SummaryBuilder};
use crate::PipelineError;

/// Everything a task needs; workers build one per process.
pub struct PipelineDeps {
    pub settings: Settings,
    pub store: TranscriptStore,
    pub checkpoints: TaskCheckpoints,
    pub consent: ConsentStore,
    pub storage: Arc<dyn ObjectStore>,
    pub bus: ProgressBus,
    pub asr: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub platform: Arc<dyn MeetingPlatform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordingOutput {
    id: String,
    meeting_session_id: Option<String>,
    duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ParticipantsOutput {
    participants: Vec<Participant>,
    num_tracks: usize,
    source_language: String,
    target_language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaddingsOutput {
    padded_tracks: Vec<PaddedTrack>,
    /// Keys this run uploaded under `tmp/`; finalize deletes exactly these.
    created_padded_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TranscriptionsOutput {
    words: Vec<Word>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MixdownOutput {
    audio_key: String,
    duration_ms: f64,
    tracks_mixed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WaveformOutput {
    segments: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TopicsOutput {
    topics: Vec<Topic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TitleOutput {
    title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubjectsOutput {
    subjects: Vec<String>,
    transcript_text: String,
    participant_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubjectSummariesOutput {
    summaries: Vec<SubjectSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecapOutput {
    short_summary: String,
    long_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActionItemsOutput {
    action_items: ActionItems,
}

pub struct MultitrackPipeline {
    deps: Arc<PipelineDeps>,
}

impl MultitrackPipeline {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }

    /// Run the workflow for one manifest. Picks up the transcript's existing
    /// `workflow_run_id` when resuming after a crash, otherwise starts a
    /// fresh run.
    pub async fn run(&self, manifest: &RecordingManifest) -> Result<(), PipelineError> {
        manifest.validate()?;
        let deps = &self.deps;
        let transcript_id = manifest.transcript_id.clone();

        let existing = deps
            .store
            .get_by_id(&transcript_id)
            .await?
            .ok_or_else(|| {
                reflector_persistence::PersistenceError::TranscriptNotFound(transcript_id.clone())
            })?;
        let run_id = existing
            .workflow_run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        deps.store
            .apply(&transcript_id, |t| {
                t.workflow_run_id = Some(run_id.clone());
                t.recording_id = Some(manifest.recording_id.clone());
                if manifest.room_id.is_some() {
                    t.room_id = manifest.room_id.clone();
                }
            })
            .await?;

        let runner = TaskRunner::new(
            deps.store.clone(),
            deps.checkpoints.clone(),
            deps.bus.clone(),
            run_id.clone(),
            transcript_id.clone(),
        );

        tracing::info!(transcript_id = %transcript_id, run_id = %run_id, tracks = manifest.tracks.len(), "multitrack pipeline starting");

        match self.execute(&runner, manifest).await {
            Ok(()) => {
                deps.checkpoints.clear_run(&run_id).await?;
                tracing::info!(transcript_id = %transcript_id, "multitrack pipeline finished");
                Ok(())
            }
            Err(e) => {
                // Workflow-level failure hook: tasks normally set the error
                // status themselves, but a failure outside any task context
                // (or a worker death) lands here. The uid-keyed STATUS event
                // makes the second write a no-op when a task already did it.
                runner.set_error_status().await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        runner: &TaskRunner,
        manifest: &RecordingManifest,
    ) -> Result<(), PipelineError> {
        let deps = &self.deps;
        let tid = manifest.transcript_id.clone();
        let timeouts = &deps.settings.pipeline;
        let short = Duration::from_secs(timeouts.timeout_short_seconds);
        let medium = Duration::from_secs(timeouts.timeout_medium_seconds);
        let long = Duration::from_secs(timeouts.timeout_long_seconds);
        let heavy = Duration::from_secs(timeouts.timeout_heavy_seconds);

        let recording: RecordingOutput = runner
            .run(&TaskPolicy::new("get_recording", short), || {
                task_get_recording(deps, manifest)
            })
            .await?;

        let participants: ParticipantsOutput = runner
            .run(&TaskPolicy::new("get_participants", short), || {
                task_get_participants(deps, manifest, &recording)
            })
            .await?;

        let paddings: PaddingsOutput = runner
            .run(&TaskPolicy::new("process_paddings", heavy), || {
                task_process_paddings(deps, manifest, &tid)
            })
            .await?;

        // Transcription fan-out and the mixdown join both consume the padded
        // tracks; they run concurrently.
        let mixdown_timeout = Duration::from_secs(
            300 + 60 * paddings.padded_tracks.len() as u64 + (recording.duration / 10.0) as u64,
        );
        let mixdown_policy = TaskPolicy::new("mixdown_tracks", mixdown_timeout)
            .serialized_on("mixdown-global", 1);
        let (transcriptions, mixdown): (TranscriptionsOutput, MixdownOutput) = tokio::try_join!(
            runner.run(&TaskPolicy::new("process_transcriptions", heavy), || {
                task_process_transcriptions(deps, &paddings, &participants.source_language)
            }),
            runner.run(&mixdown_policy, || task_mixdown(deps, &tid, &paddings)),
        )?;

        let waveform_branch = async {
            let _waveform: WaveformOutput = runner
                .run(&TaskPolicy::new("generate_waveform", medium), || {
                    task_generate_waveform(deps, &tid, &mixdown.audio_key)
                })
                .await?;
            Ok::<(), PipelineError>(())
        };

        let topics_branch = async {
            let topics: TopicsOutput = runner
                .run(&TaskPolicy::new("detect_topics", heavy), || {
                    task_detect_topics(deps, &tid, &transcriptions.words)
                })
                .await?;

            let title_fut = async {
                let _title: TitleOutput = runner
                    .run(&TaskPolicy::new("generate_title", heavy), || {
                        task_generate_title(deps, &tid, &topics.topics)
                    })
                    .await?;
                Ok::<(), PipelineError>(())
            };

            let subjects_chain = async {
                let subjects: SubjectsOutput = runner
                    .run(&TaskPolicy::new("extract_subjects", medium), || {
                        task_extract_subjects(deps, &tid, &topics.topics)
                    })
                    .await?;

                let recap_fut = async {
                    let summaries: SubjectSummariesOutput = runner
                        .run(&TaskPolicy::new("process_subjects", heavy), || {
                            task_process_subjects(deps, &subjects)
                        })
                        .await?;
                    let _recap: RecapOutput = runner
                        .run(&TaskPolicy::new("generate_recap", medium), || {
                            task_generate_recap(deps, &tid, &subjects, &summaries)
                        })
                        .await?;
                    Ok::<(), PipelineError>(())
                };

                let actions_fut = async {
                    let _actions: ActionItemsOutput = runner
                        .run(&TaskPolicy::new("identify_action_items", long), || {
                            task_identify_action_items(deps, &tid, &subjects)
                        })
                        .await?;
                    Ok::<(), PipelineError>(())
                };

                tokio::try_join!(recap_fut, actions_fut)?;
                Ok::<(), PipelineError>(())
            };

            tokio::try_join!(title_fut, subjects_chain)?;
            Ok::<(), PipelineError>(())
        };

        tokio::try_join!(waveform_branch, topics_branch)?;

        runner
            .run(&TaskPolicy::new("finalize", short), || {
                task_finalize(deps, &tid, &mixdown, &transcriptions.words, &paddings)
            })
            .await?;

        // Post-finalize tail: consent cleanup and notifications never flip
        // the transcript into error; their failures are logged and left to
        // converge on later runs.
        if let Err(e) = runner
            .run(&TaskPolicy::new("cleanup_consent", short).non_fatal(), || {
                task_cleanup_consent(deps, manifest, &tid)
            })
            .await
        {
            tracing::warn!(transcript_id = %tid, error = %e, "consent cleanup failed");
        }

        let notify_policy = TaskPolicy::new("post_notification", short)
            .attempts(5)
            .non_fatal();
        let webhook_policy = TaskPolicy::new("send_webhook", medium)
            .attempts(5)
            .non_fatal();
        let (chat, webhook) = tokio::join!(
            runner.run(&notify_policy, || task_post_notification(deps, &tid)),
            runner.run(&webhook_policy, || task_send_webhook(deps, &tid)),
        );
        if let Err(e) = chat {
            tracing::warn!(transcript_id = %tid, error = %e, "chat notification failed");
        }
        if let Err(e) = webhook {
            tracing::warn!(transcript_id = %tid, error = %e, "completion webhook failed");
        }

        Ok(())
    }
}

/// Await an indexed fan-out, restoring spawn order. The first failure aborts
/// the remaining children.
async fn join_indexed<T: Send + 'static>(
    mut set: JoinSet<(usize, Result<T, PipelineError>)>,
) -> Result<Vec<T>, PipelineError> {
    let mut slots: Vec<Option<T>> = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (index, result) = joined?;
        let value = result?;
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        slots[index] = Some(value);
    }
    Ok(slots.into_iter().flatten().collect())
}

async fn task_get_recording(
    deps: &PipelineDeps,
    manifest: &RecordingManifest,
) -> Result<RecordingOutput, PipelineError> {
    let tid = &manifest.transcript_id;
    tracing::info!(transcript_id = %tid, recording_id = %manifest.recording_id, "fetching recording metadata");

    // A re-run starts from a clean slate; the title survives on purpose.
    deps.store
        .apply(tid, |t| {
            t.events.clear();
            t.topics.clear();
            t.participants.clear();
        })
        .await?;
    set_status_and_broadcast(&deps.store, &deps.bus, tid, TranscriptStatus::Processing).await?;

    let info = deps.platform.get_recording(&manifest.recording_id).await?;
    Ok(RecordingOutput {
        id: info.id,
        meeting_session_id: info.meeting_session_id,
        duration: info.duration,
    })
}

async fn task_get_participants(
    deps: &PipelineDeps,
    manifest: &RecordingManifest,
    recording: &RecordingOutput,
) -> Result<ParticipantsOutput, PipelineError> {
    let tid = &manifest.transcript_id;
    let transcript = deps
        .store
        .get_by_id(tid)
        .await?
        .ok_or_else(|| reflector_persistence::PersistenceError::TranscriptNotFound(tid.clone()))?;

    let roster = match &recording.meeting_session_id {
        Some(session_id) => deps.platform.get_meeting_participants(session_id).await?,
        None => Vec::new(),
    };
    let mut id_to_name = std::collections::HashMap::new();
    let mut id_to_user = std::collections::HashMap::new();
    for entry in &roster {
        if let Some(name) = &entry.user_name {
            id_to_name.insert(entry.participant_id.clone(), name.clone());
        }
        if let Some(user_id) = &entry.user_id {
            id_to_user.insert(entry.participant_id.clone(), user_id.clone());
        }
    }

    let track_keys = manifest.track_keys();
    let cam_audio_keys = filter_cam_audio_tracks(&track_keys);

    let mut participants = Vec::new();
    for (idx, key) in cam_audio_keys.iter().enumerate() {
        let participant_id = match parse_track_key(key) {
            Ok(parsed) => parsed.participant_id,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "failed to parse recording track key");
                continue;
            }
        };
        let name = id_to_name
            .get(&participant_id)
            .cloned()
            .unwrap_or_else(|| format!("Speaker {idx}"));
        let participant = Participant {
            id: participant_id,
            speaker: idx,
            name,
            user_id: id_to_user.get(&participant_id).cloned(),
        };
        deps.store
            .apply(tid, |t| t.upsert_participant(participant.clone()))
            .await?;
        participants.push(participant);
    }

    tracing::info!(transcript_id = %tid, participants = participants.len(), "roster resolved");
    Ok(ParticipantsOutput {
        participants,
        num_tracks: manifest.tracks.len(),
        source_language: transcript.source_language,
        target_language: transcript.target_language,
    })
}

async fn task_process_paddings(
    deps: &PipelineDeps,
    manifest: &RecordingManifest,
    tid: &str,
) -> Result<PaddingsOutput, PipelineError> {
    tracing::info!(transcript_id = %tid, tracks = manifest.tracks.len(), "padding fan-out");
    let deps_arc = clone_deps(deps);

    let mut set = JoinSet::new();
    for (index, track) in manifest.tracks.iter().enumerate() {
        let deps = deps_arc.clone();
        let bucket = manifest.bucket.clone();
        let key = track.s3_key.clone();
        let tid = tid.to_string();
        set.spawn(async move {
            let result = pad_track(&deps, &tid, index, &bucket, &key).await;
            (index, result)
        });
    }
    let padded_tracks = join_indexed(set).await?;

    let created_padded_keys = padded_tracks
        .iter()
        .filter(|t: &&PaddedTrack| t.was_padded)
        .map(|t| t.padded_key.clone())
        .collect();
    Ok(PaddingsOutput {
        padded_tracks,
        created_padded_keys,
    })
}

async fn task_process_transcriptions(
    deps: &PipelineDeps,
    paddings: &PaddingsOutput,
    language: &str,
) -> Result<TranscriptionsOutput, PipelineError> {
    tracing::info!(tracks = paddings.padded_tracks.len(), language, "transcription fan-out");
    let deps_arc = clone_deps(deps);

    let mut set = JoinSet::new();
    for track in paddings.padded_tracks.iter().cloned() {
        let deps = deps_arc.clone();
        let language = language.to_string();
        let index = track.track_index;
        set.spawn(async move {
            let result = transcribe_track(&deps, &track, &language).await;
            (index, result)
        });
    }
    let per_track = join_indexed(set).await?;
    let words = merge_track_words(per_track);
    tracing::info!(words = words.len(), "tracks transcribed and merged");
    Ok(TranscriptionsOutput { words })
}

async fn task_mixdown(
    deps: &PipelineDeps,
    tid: &str,
    paddings: &PaddingsOutput,
) -> Result<MixdownOutput, PipelineError> {
    let ttl = deps.presign_ttl();
    let mut urls = Vec::with_capacity(paddings.padded_tracks.len());
    for track in &paddings.padded_tracks {
        // Presign on demand: URLs stored in task outputs would outlive their
        // time bound on replay.
        let url = deps
            .storage
            .presigned_url(&track.bucket, &track.padded_key, PresignOperation::Get, ttl)
            .await?;
        urls.push(url);
    }

    let temp = tempfile::Builder::new().suffix(".mp3").tempfile()?;
    let output_path = temp.into_temp_path();
    let blocking_path = output_path.to_path_buf();
    let mix_output = tokio::task::spawn_blocking(
        move || -> Result<reflector_audio::MixOutput, PipelineError> {
            let target_rate = reflector_audio::detect_sample_rate(&urls)
                .ok_or(reflector_audio::AudioError::NoDecodableAudio)?;
            let out = reflector_audio::mix(&urls, &blocking_path, target_rate, None)?;
            Ok(out)
        },
    )
    .await??;

    let audio_key = format!("{tid}/audio.mp3");
    let bucket = deps.settings.storage.transcript_bucket.clone();
    deps.storage
        .put_file(&bucket, &audio_key, &output_path)
        .await?;
    drop(output_path);

    deps.store
        .apply(tid, |t| t.audio_location = AudioLocation::Storage)
        .await?;

    tracing::info!(
        transcript_id = %tid,
        audio_key = %audio_key,
        duration_ms = mix_output.duration_ms,
        tracks = mix_output.tracks_mixed,
        "mixdown uploaded"
    );
    Ok(MixdownOutput {
        audio_key,
        duration_ms: mix_output.duration_ms,
        tracks_mixed: mix_output.tracks_mixed,
    })
}

async fn task_generate_waveform(
    deps: &PipelineDeps,
    tid: &str,
    audio_key: &str,
) -> Result<WaveformOutput, PipelineError> {
    let bucket = deps.settings.storage.transcript_bucket.clone();
    let url = deps
        .storage
        .presigned_url(&bucket, audio_key, PresignOperation::Get, deps.presign_ttl())
        .await?;

    let segments = deps.settings.pipeline.waveform_segments;
    let waveform = tokio::task::spawn_blocking(move || {
        reflector_audio::waveform_from_file(Path::new(&url), segments)
    })
    .await??;

    let data_dir = Path::new(&deps.settings.server.data_dir).join(tid);
    tokio::fs::create_dir_all(&data_dir).await?;
    let waveform_path = data_dir.join("audio.json");
    tokio::fs::write(&waveform_path, serde_json::to_vec(&waveform)?).await?;
    tracing::info!(transcript_id = %tid, path = %waveform_path.display(), "waveform written");

    append_event_and_broadcast(
        &deps.store,
        &deps.bus,
        tid,
        "waveform",
        ProgressEvent::Waveform {
            waveform: waveform.clone(),
        },
        |_| {},
    )
    .await?;

    Ok(WaveformOutput { segments })
}

async fn task_detect_topics(
    deps: &PipelineDeps,
    tid: &str,
    words: &[Word],
) -> Result<TopicsOutput, PipelineError> {
    if words.is_empty() {
        tracing::info!(transcript_id = %tid, "no words, skipping topic detection");
        return Ok(TopicsOutput { topics: Vec::new() });
    }

    let chunks = chunk_words(words, deps.settings.pipeline.topic_chunk_word_count);
    tracing::info!(transcript_id = %tid, chunks = chunks.len(), "topic chunk fan-out");

    let mut set = JoinSet::new();
    for chunk in chunks {
        let llm = deps.llm.clone();
        let tid = tid.to_string();
        let index = chunk.chunk_index;
        set.spawn(async move {
            let result = label_topic_chunk(llm.as_ref(), &tid, &chunk).await;
            (index, result)
        });
    }
    // Chunks finish in any order; collection restores chunk-index order so
    // topics are upserted and published monotonically.
    let topics = join_indexed(set).await?;

    for topic in &topics {
        let topic = topic.clone();
        append_event_and_broadcast(
            &deps.store,
            &deps.bus,
            tid,
            &format!("topic:{}", topic.id),
            ProgressEvent::Topic(topic.clone()),
            |t| t.upsert_topic(topic.clone()),
        )
        .await?;
    }

    Ok(TopicsOutput { topics })
}

async fn task_generate_title(
    deps: &PipelineDeps,
    tid: &str,
    topics: &[Topic],
) -> Result<TitleOutput, PipelineError> {
    if topics.is_empty() {
        return Ok(TitleOutput { title: None });
    }
    let pairs: Vec<(String, String)> = topics
        .iter()
        .map(|t| (t.title.clone(), t.summary.clone()))
        .collect();
    let title = summary::generate_title(deps.llm.as_ref(), &pairs).await?;

    // Never overwrite a non-empty title on re-run, but always re-publish the
    // event so subscribers reconcile deterministically.
    append_event_and_broadcast(
        &deps.store,
        &deps.bus,
        tid,
        "final_title",
        ProgressEvent::FinalTitle {
            title: title.clone(),
        },
        |t| {
            if t.title.as_deref().map_or(true, str::is_empty) {
                t.title = Some(title.clone());
            }
        },
    )
    .await?;

    Ok(TitleOutput { title: Some(title) })
}

async fn task_extract_subjects(
    deps: &PipelineDeps,
    tid: &str,
    topics: &[Topic],
) -> Result<SubjectsOutput, PipelineError> {
    if topics.is_empty() {
        return Ok(SubjectsOutput {
            subjects: Vec::new(),
            transcript_text: String::new(),
            participant_names: Vec::new(),
        });
    }

    let transcript = deps
        .store
        .get_by_id(tid)
        .await?
        .ok_or_else(|| reflector_persistence::PersistenceError::TranscriptNotFound(tid.to_string()))?;

    let mut lines = Vec::new();
    for topic in topics {
        lines.extend(transcript.speaker_lines(&topic.words));
    }
    let transcript_text = lines.join("\n");
    let participant_names: Vec<String> = transcript
        .participants
        .iter()
        .map(|p| p.name.clone())
        .collect();

    let builder = SummaryBuilder::new(deps.llm.as_ref(), transcript_text.clone())
        .with_participants(participant_names.clone());
    let subjects = builder.extract_subjects().await?;
    tracing::info!(transcript_id = %tid, subjects = subjects.len(), "subjects extracted");

    Ok(SubjectsOutput {
        subjects,
        transcript_text,
        participant_names,
    })
}

async fn task_process_subjects(
    deps: &PipelineDeps,
    subjects: &SubjectsOutput,
) -> Result<SubjectSummariesOutput, PipelineError> {
    if subjects.subjects.is_empty() {
        return Ok(SubjectSummariesOutput {
            summaries: Vec::new(),
        });
    }
    tracing::info!(subjects = subjects.subjects.len(), "subject summary fan-out");

    let mut set = JoinSet::new();
    for (index, subject) in subjects.subjects.iter().cloned().enumerate() {
        let llm = deps.llm.clone();
        let transcript_text = subjects.transcript_text.clone();
        let participant_names = subjects.participant_names.clone();
        set.spawn(async move {
            let builder =
                SummaryBuilder::new(llm.as_ref(), transcript_text).with_participants(participant_names);
            let result = builder
                .summarize_subject(&subject)
                .await
                .map_err(PipelineError::from);
            (index, result)
        });
    }
    let summaries = join_indexed(set).await?;
    Ok(SubjectSummariesOutput { summaries })
}

async fn task_generate_recap(
    deps: &PipelineDeps,
    tid: &str,
    subjects: &SubjectsOutput,
    summaries: &SubjectSummariesOutput,
) -> Result<RecapOutput, PipelineError> {
    if summaries.summaries.is_empty() {
        return Ok(RecapOutput {
            short_summary: String::new(),
            long_summary: String::new(),
        });
    }

    let builder = SummaryBuilder::new(deps.llm.as_ref(), subjects.transcript_text.clone())
        .with_participants(subjects.participant_names.clone());
    let short_summary = builder.generate_recap(&summaries.summaries).await?;
    let long_summary = summary::build_summary_markdown(&short_summary, &summaries.summaries);

    let short_clone = short_summary.clone();
    let long_clone = long_summary.clone();
    append_event_and_broadcast(
        &deps.store,
        &deps.bus,
        tid,
        "final_short_summary",
        ProgressEvent::FinalShortSummary {
            short_summary: short_summary.clone(),
        },
        move |t| {
            t.short_summary = Some(short_clone);
            t.long_summary = Some(long_clone);
        },
    )
    .await?;
    append_event_and_broadcast(
        &deps.store,
        &deps.bus,
        tid,
        "final_long_summary",
        ProgressEvent::FinalLongSummary {
            long_summary: long_summary.clone(),
        },
        |_| {},
    )
    .await?;

    Ok(RecapOutput {
        short_summary,
        long_summary,
    })
}

async fn task_identify_action_items(
    deps: &PipelineDeps,
    tid: &str,
    subjects: &SubjectsOutput,
) -> Result<ActionItemsOutput, PipelineError> {
    if subjects.transcript_text.is_empty() {
        return Ok(ActionItemsOutput {
            action_items: ActionItems::default(),
        });
    }

    let builder = SummaryBuilder::new(deps.llm.as_ref(), subjects.transcript_text.clone())
        .with_participants(subjects.participant_names.clone());
    // Action items failing never blocks the rest of the tail; the transcript
    // just ships without them.
    let action_items = match builder.identify_action_items().await {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(transcript_id = %tid, error = %e, "action item extraction failed, using empty set");
            ActionItems::default()
        }
    };

    let items_clone = action_items.clone();
    append_event_and_broadcast(
        &deps.store,
        &deps.bus,
        tid,
        "action_items",
        ProgressEvent::ActionItems {
            action_items: action_items.clone(),
        },
        move |t| t.action_items = Some(items_clone),
    )
    .await?;

    Ok(ActionItemsOutput { action_items })
}

async fn task_finalize(
    deps: &PipelineDeps,
    tid: &str,
    mixdown: &MixdownOutput,
    words: &[Word],
    paddings: &PaddingsOutput,
) -> Result<(), PipelineError> {
    append_event_and_broadcast(
        &deps.store,
        &deps.bus,
        tid,
        "transcript",
        ProgressEvent::Transcript {
            text: reflector_core::words_text(words),
            translation: None,
        },
        |_| {},
    )
    .await?;

    let duration_ms = mixdown.duration_ms;
    append_event_and_broadcast(
        &deps.store,
        &deps.bus,
        tid,
        "duration",
        ProgressEvent::Duration {
            duration: duration_ms,
        },
        move |t| {
            t.duration = duration_ms;
            // Run completed; nothing left to resume.
            t.workflow_run_id = None;
        },
    )
    .await?;

    set_status_and_broadcast(&deps.store, &deps.bus, tid, TranscriptStatus::Ended).await?;

    // Padded blobs are deleted here and not in the padding children, so
    // replayed consumers could still re-presign them during the run.
    if !paddings.created_padded_keys.is_empty() {
        tracing::info!(
            transcript_id = %tid,
            keys = paddings.created_padded_keys.len(),
            "cleaning up temporary padded tracks"
        );
        let bucket = deps.settings.storage.transcript_bucket.clone();
        let deletions = paddings
            .created_padded_keys
            .iter()
            .map(|key| deps.storage.delete(&bucket, key));
        for (key, result) in paddings
            .created_padded_keys
            .iter()
            .zip(futures::future::join_all(deletions).await)
        {
            if let Err(e) = result {
                tracing::warn!(key = %key, error = %e, "failed to clean up padded track");
            }
        }
    }

    Ok(())
}

async fn task_cleanup_consent(
    deps: &PipelineDeps,
    manifest: &RecordingManifest,
    tid: &str,
) -> Result<(), PipelineError> {
    let Some(transcript) = deps.store.get_by_id(tid).await? else {
        tracing::warn!(transcript_id = %tid, "consent cleanup: transcript missing");
        return Ok(());
    };

    let consent_denied = match &transcript.meeting_id {
        Some(meeting_id) => deps.consent.has_any_denial(meeting_id).await?,
        None => false,
    };
    if !consent_denied {
        tracing::info!(transcript_id = %tid, "consent approved, keeping all files");
        return Ok(());
    }

    tracing::info!(transcript_id = %tid, "consent denied, deleting audio");
    let mut deletion_errors = Vec::new();

    for key in manifest.track_keys() {
        if let Err(e) = deps.storage.delete(&manifest.bucket, &key).await {
            tracing::error!(key = %key, error = %e, "failed to delete original recording");
            deletion_errors.push(format!("{key}: {e}"));
        }
    }

    if transcript.audio_location == AudioLocation::Storage {
        let bucket = deps.settings.storage.transcript_bucket.clone();
        let audio_key = transcript.storage_audio_path();
        if let Err(e) = deps.storage.delete(&bucket, &audio_key).await {
            tracing::error!(key = %audio_key, error = %e, "failed to delete mixed audio");
            deletion_errors.push(format!("{audio_key}: {e}"));
        }
    }

    if deletion_errors.is_empty() {
        deps.store.apply(tid, |t| t.audio_deleted = true).await?;
        tracing::info!(transcript_id = %tid, "all audio deleted");
    } else {
        // Flag stays unset so a retry converges on the remaining objects.
        tracing::warn!(
            transcript_id = %tid,
            errors = deletion_errors.len(),
            "consent cleanup incomplete"
        );
    }
    Ok(())
}

async fn task_post_notification(deps: &PipelineDeps, tid: &str) -> Result<(), PipelineError> {
    let Some(transcript) = deps.store.get_by_id(tid).await? else {
        return Ok(());
    };
    let message_id = notify::post_chat_notification(&deps.settings.zulip, &transcript).await?;
    if let (Some(id), None) = (message_id, transcript.zulip_message_id) {
        deps.store
            .apply(tid, |t| t.zulip_message_id = Some(id))
            .await?;
    }
    Ok(())
}

async fn task_send_webhook(deps: &PipelineDeps, tid: &str) -> Result<bool, PipelineError> {
    let Some(transcript) = deps.store.get_by_id(tid).await? else {
        return Ok(false);
    };
    notify::send_webhook(&deps.settings.webhook, &transcript).await
}

/// Tasks fan out onto owned futures; wrap the borrowed deps in a fresh Arc
/// sharing the same inner services.
fn clone_deps(deps: &PipelineDeps) -> Arc<PipelineDeps> {
    Arc::new(PipelineDeps {
        settings: deps.settings.clone(),
        store: deps.store.clone(),
        checkpoints: deps.checkpoints.clone(),
        consent: deps.consent.clone(),
        storage: deps.storage.clone(),
        bus: deps.bus.clone(),
        asr: deps.asr.clone(),
        llm: deps.llm.clone(),
        platform: deps.platform.clone(),
    })
}
