//! Progress pub/sub keyed by transcript id.
//!
//! Publishing rides on the store commit: `append_event_and_broadcast`
//! persists the event (uid-deduplicated) and only then publishes, so a
//! subscriber never observes an event that is not durable. Late subscribers
//! replay the persisted suffix from their resume cursor before going live —
//! a crash between commit and publish therefore loses nothing.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use reflector_core::{ProgressEvent, Transcript, TranscriptEvent, TranscriptStatus};
use reflector_persistence::{PersistenceError, TranscriptStore};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct ProgressBus {
    channels: Arc<DashMap<String, broadcast::Sender<TranscriptEvent>>>,
    /// Held across append + publish so the bus order is the commit order
    /// even when concurrent tasks emit for the same transcript.
    append_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    store: TranscriptStore,
}

impl ProgressBus {
    pub fn new(store: TranscriptStore) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            append_locks: Arc::new(DashMap::new()),
            store,
        }
    }

    fn append_lock(&self, transcript_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.append_locks
            .entry(transcript_id.to_string())
            .or_default()
            .clone()
    }

    fn sender(&self, transcript_id: &str) -> broadcast::Sender<TranscriptEvent> {
        self.channels
            .entry(transcript_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish to live subscribers. Callers must have persisted the event
    /// first; use [`append_event_and_broadcast`] rather than calling this
    /// directly.
    pub fn publish(&self, transcript_id: &str, event: &TranscriptEvent) {
        // No receivers is fine; replay covers late subscribers.
        let _ = self.sender(transcript_id).send(event.clone());
    }

    /// Subscribe with a resume cursor (index into the event log). Returns the
    /// persisted suffix from `cursor` plus a live receiver registered before
    /// the replay read, so nothing falls between.
    pub async fn subscribe(
        &self,
        transcript_id: &str,
        cursor: usize,
    ) -> Result<(Vec<TranscriptEvent>, broadcast::Receiver<TranscriptEvent>), PersistenceError>
    {
        let receiver = self.sender(transcript_id).subscribe();
        let replay = self.store.events_from(transcript_id, cursor).await?;
        Ok((replay, receiver))
    }
}

/// Append `payload` under `uid` and publish it, atomically with any extra
/// field mutation `mutate` performs on the aggregate. Replays with an
/// already-seen uid neither re-append nor re-publish.
pub async fn append_event_and_broadcast<F>(
    store: &TranscriptStore,
    bus: &ProgressBus,
    transcript_id: &str,
    uid: &str,
    payload: ProgressEvent,
    mutate: F,
) -> Result<Transcript, PersistenceError>
where
    F: FnOnce(&mut Transcript),
{
    let event = TranscriptEvent::new(uid, payload);
    let lock = bus.append_lock(transcript_id);
    let _guard = lock.lock().await;
    let mut appended = false;
    let transcript = store
        .apply(transcript_id, |t| {
            mutate(t);
            appended = t.add_event(event.clone()).is_some();
        })
        .await?;
    if appended {
        bus.publish(transcript_id, &event);
    } else {
        tracing::debug!(transcript_id, uid, "event already persisted, not re-published");
    }
    Ok(transcript)
}

/// Set the transcript status and emit the matching STATUS event.
pub async fn set_status_and_broadcast(
    store: &TranscriptStore,
    bus: &ProgressBus,
    transcript_id: &str,
    status: TranscriptStatus,
) -> Result<Transcript, PersistenceError> {
    append_event_and_broadcast(
        store,
        bus,
        transcript_id,
        &format!("status:{}", status.as_str()),
        ProgressEvent::Status { value: status },
        |t| t.status = status,
    )
    .await
}
