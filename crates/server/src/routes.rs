//! HTTP surface: health, manifest enqueue, and the per-transcript WebSocket
//! event stream.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use reflector_core::{RecordingManifest, Transcript};
use reflector_pipeline::MultitrackPipeline;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/recordings/process", post(enqueue_recording))
        .route("/v1/transcripts/:id/events", get(transcript_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Start (or resume) the multitrack pipeline for a recording manifest. The
/// transcript row is created when it does not exist yet; processing runs in
/// the background and progress streams over the events socket.
async fn enqueue_recording(
    State(state): State<AppState>,
    Json(manifest): Json<RecordingManifest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    manifest
        .validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let store = &state.deps.store;
    let existing = store
        .get_by_id(&manifest.transcript_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if existing.is_none() {
        let mut transcript = Transcript::new(format!("Recording {}", manifest.recording_id));
        transcript.id = manifest.transcript_id.clone();
        transcript.recording_id = Some(manifest.recording_id.clone());
        transcript.room_id = manifest.room_id.clone();
        store
            .create(transcript)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    }

    let deps = state.deps.clone();
    let transcript_id = manifest.transcript_id.clone();
    tokio::spawn(async move {
        let pipeline = MultitrackPipeline::new(deps);
        if let Err(e) = pipeline.run(&manifest).await {
            tracing::error!(transcript_id = %manifest.transcript_id, error = %e, "pipeline run failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"transcript_id": transcript_id})),
    ))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Resume cursor: index into the transcript's event log.
    #[serde(default)]
    cursor: usize,
}

async fn transcript_events(
    State(state): State<AppState>,
    Path(transcript_id): Path<String>,
    Query(query): Query<EventsQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| stream_events(state, transcript_id, query.cursor, socket))
}

/// Replay the persisted suffix from the cursor, then forward live events.
/// Each frame is one JSON object: `{"event": ..., "data": ...}`.
async fn stream_events(state: AppState, transcript_id: String, cursor: usize, mut socket: WebSocket) {
    let (replay, mut live) = match state.deps.bus.subscribe(&transcript_id, cursor).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(transcript_id = %transcript_id, error = %e, "event subscription failed");
            let _ = socket.close().await;
            return;
        }
    };

    let mut replayed_uids = Vec::with_capacity(replay.len());
    for event in replay {
        replayed_uids.push(event.uid.clone());
        if send_event(&mut socket, &event.payload).await.is_err() {
            return;
        }
    }

    loop {
        match live.recv().await {
            Ok(event) => {
                // An event published while we replayed shows up twice; the
                // uid dedupes it.
                if replayed_uids.iter().any(|uid| uid == &event.uid) {
                    continue;
                }
                if send_event(&mut socket, &event.payload).await.is_err() {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(transcript_id = %transcript_id, skipped, "event subscriber lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn send_event(
    socket: &mut WebSocket,
    payload: &reflector_core::ProgressEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(payload) {
        Ok(json) => socket.send(Message::Text(json)).await,
        Err(e) => {
            tracing::error!(error = %e, "event serialization failed");
            Ok(())
        }
    }
}
