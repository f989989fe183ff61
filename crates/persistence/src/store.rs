//! Transcript rows: scalar columns plus JSON columns for the aggregate's
//! arrays (topics, events, participants).

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use reflector_core::{
    ActionItems, AudioLocation, Participant, Topic, Transcript, TranscriptEvent, TranscriptStatus,
};

use crate::tasks;
use crate::PersistenceError;

const CREATE_TRANSCRIPTS: &str = r#"
CREATE TABLE IF NOT EXISTS transcript (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    duration REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    title TEXT,
    short_summary TEXT,
    long_summary TEXT,
    action_items TEXT,
    topics TEXT NOT NULL DEFAULT '[]',
    events TEXT NOT NULL DEFAULT '[]',
    participants TEXT NOT NULL DEFAULT '[]',
    source_language TEXT NOT NULL DEFAULT 'en',
    target_language TEXT NOT NULL DEFAULT 'en',
    audio_location TEXT NOT NULL DEFAULT 'local',
    audio_deleted INTEGER NOT NULL DEFAULT 0,
    meeting_id TEXT,
    recording_id TEXT,
    room_id TEXT,
    workflow_run_id TEXT,
    zulip_message_id INTEGER
)
"#;

#[derive(Clone)]
pub struct TranscriptStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl TranscriptStore {
    /// Connect and ensure the schema. A single connection keeps SQLite's
    /// writer model simple and makes commit order the append order.
    pub async fn connect(url: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TRANSCRIPTS).execute(&pool).await?;
        tasks::ensure_schema(&pool).await?;
        tracing::info!(url = %url, "Transcript store ready");

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create(&self, transcript: Transcript) -> Result<Transcript, PersistenceError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"INSERT INTO transcript (
                id, name, status, duration, created_at, title, short_summary,
                long_summary, action_items, topics, events, participants,
                source_language, target_language, audio_location, audio_deleted,
                meeting_id, recording_id, room_id, workflow_run_id, zulip_message_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&transcript.id)
        .bind(&transcript.name)
        .bind(transcript.status.as_str())
        .bind(transcript.duration)
        .bind(transcript.created_at.to_rfc3339())
        .bind(&transcript.title)
        .bind(&transcript.short_summary)
        .bind(&transcript.long_summary)
        .bind(
            transcript
                .action_items
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&transcript.topics)?)
        .bind(serde_json::to_string(&transcript.events)?)
        .bind(serde_json::to_string(&transcript.participants)?)
        .bind(&transcript.source_language)
        .bind(&transcript.target_language)
        .bind(audio_location_str(transcript.audio_location))
        .bind(transcript.audio_deleted as i64)
        .bind(&transcript.meeting_id)
        .bind(&transcript.recording_id)
        .bind(&transcript.room_id)
        .bind(&transcript.workflow_run_id)
        .bind(transcript.zulip_message_id)
        .execute(&self.pool)
        .await?;
        Ok(transcript)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Transcript>, PersistenceError> {
        let row = sqlx::query("SELECT * FROM transcript WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_transcript).transpose()
    }

    /// Load, mutate, and persist the aggregate as one UPDATE under the write
    /// lock. This is the serializable-transaction scope for every multi-field
    /// mutation and co-located event append.
    pub async fn apply<F>(&self, id: &str, mutate: F) -> Result<Transcript, PersistenceError>
    where
        F: FnOnce(&mut Transcript),
    {
        let _guard = self.write_lock.lock().await;
        let row = sqlx::query("SELECT * FROM transcript WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::TranscriptNotFound(id.to_string()))?;
        let mut transcript = row_to_transcript(row)?;
        mutate(&mut transcript);
        self.save_row(&transcript).await?;
        Ok(transcript)
    }

    async fn save_row(&self, transcript: &Transcript) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"UPDATE transcript SET
                name = ?, status = ?, duration = ?, title = ?, short_summary = ?,
                long_summary = ?, action_items = ?, topics = ?, events = ?,
                participants = ?, source_language = ?, target_language = ?,
                audio_location = ?, audio_deleted = ?, meeting_id = ?,
                recording_id = ?, room_id = ?, workflow_run_id = ?, zulip_message_id = ?
            WHERE id = ?"#,
        )
        .bind(&transcript.name)
        .bind(transcript.status.as_str())
        .bind(transcript.duration)
        .bind(&transcript.title)
        .bind(&transcript.short_summary)
        .bind(&transcript.long_summary)
        .bind(
            transcript
                .action_items
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&transcript.topics)?)
        .bind(serde_json::to_string(&transcript.events)?)
        .bind(serde_json::to_string(&transcript.participants)?)
        .bind(&transcript.source_language)
        .bind(&transcript.target_language)
        .bind(audio_location_str(transcript.audio_location))
        .bind(transcript.audio_deleted as i64)
        .bind(&transcript.meeting_id)
        .bind(&transcript.recording_id)
        .bind(&transcript.room_id)
        .bind(&transcript.workflow_run_id)
        .bind(transcript.zulip_message_id)
        .bind(&transcript.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM transcript WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Events at or after `cursor`, for progress-bus replay to late
    /// subscribers.
    pub async fn events_from(
        &self,
        id: &str,
        cursor: usize,
    ) -> Result<Vec<TranscriptEvent>, PersistenceError> {
        let transcript = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| PersistenceError::TranscriptNotFound(id.to_string()))?;
        Ok(transcript.events.into_iter().skip(cursor).collect())
    }
}

fn audio_location_str(location: AudioLocation) -> &'static str {
    match location {
        AudioLocation::Local => "local",
        AudioLocation::Storage => "storage",
    }
}

fn row_to_transcript(row: SqliteRow) -> Result<Transcript, PersistenceError> {
    let status: String = row.try_get("status")?;
    let audio_location: String = row.try_get("audio_location")?;
    let created_at: String = row.try_get("created_at")?;
    let action_items: Option<String> = row.try_get("action_items")?;
    let topics: String = row.try_get("topics")?;
    let events: String = row.try_get("events")?;
    let participants: String = row.try_get("participants")?;

    Ok(Transcript {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: match status.as_str() {
            "processing" => TranscriptStatus::Processing,
            "ended" => TranscriptStatus::Ended,
            "error" => TranscriptStatus::Error,
            _ => TranscriptStatus::Idle,
        },
        duration: row.try_get("duration")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        title: row.try_get("title")?,
        short_summary: row.try_get("short_summary")?,
        long_summary: row.try_get("long_summary")?,
        action_items: action_items
            .map(|raw| serde_json::from_str::<ActionItems>(&raw))
            .transpose()?,
        topics: serde_json::from_str::<Vec<Topic>>(&topics)?,
        events: serde_json::from_str::<Vec<TranscriptEvent>>(&events)?,
        participants: serde_json::from_str::<Vec<Participant>>(&participants)?,
        source_language: row.try_get("source_language")?,
        target_language: row.try_get("target_language")?,
        audio_location: match audio_location.as_str() {
            "storage" => AudioLocation::Storage,
            _ => AudioLocation::Local,
        },
        audio_deleted: row.try_get::<i64, _>("audio_deleted")? != 0,
        meeting_id: row.try_get("meeting_id")?,
        recording_id: row.try_get("recording_id")?,
        room_id: row.try_get("room_id")?,
        workflow_run_id: row.try_get("workflow_run_id")?,
        zulip_message_id: row.try_get("zulip_message_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflector_core::ProgressEvent;

    async fn memory_store() -> TranscriptStore {
        TranscriptStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_roundtrip() {
        let store = memory_store().await;
        let mut transcript = Transcript::new("weekly sync");
        transcript.source_language = "en".into();
        let created = store.create(transcript).await.unwrap();

        let loaded = store.get_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "weekly sync");
        assert_eq!(loaded.status, TranscriptStatus::Idle);
        assert!(loaded.topics.is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = memory_store().await;
        assert!(store.get_by_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_persists_event_and_field_atomically() {
        let store = memory_store().await;
        let transcript = store.create(Transcript::new("t")).await.unwrap();

        store
            .apply(&transcript.id, |t| {
                t.status = TranscriptStatus::Processing;
                t.add_event(TranscriptEvent::new(
                    "status:processing",
                    ProgressEvent::Status {
                        value: TranscriptStatus::Processing,
                    },
                ));
            })
            .await
            .unwrap();

        let loaded = store.get_by_id(&transcript.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TranscriptStatus::Processing);
        assert_eq!(loaded.events.len(), 1);
        assert_eq!(loaded.events[0].uid, "status:processing");
    }

    #[tokio::test]
    async fn test_apply_dedupes_event_uid_across_replays() {
        let store = memory_store().await;
        let transcript = store.create(Transcript::new("t")).await.unwrap();

        for _ in 0..2 {
            store
                .apply(&transcript.id, |t| {
                    t.add_event(TranscriptEvent::new(
                        "finalize:duration",
                        ProgressEvent::Duration { duration: 9000.0 },
                    ));
                })
                .await
                .unwrap();
        }

        let loaded = store.get_by_id(&transcript.id).await.unwrap().unwrap();
        assert_eq!(loaded.events.len(), 1);
    }

    #[tokio::test]
    async fn test_events_from_cursor() {
        let store = memory_store().await;
        let transcript = store.create(Transcript::new("t")).await.unwrap();
        for i in 0..3 {
            store
                .apply(&transcript.id, |t| {
                    t.add_event(TranscriptEvent::new(
                        format!("duration:{i}"),
                        ProgressEvent::Duration { duration: i as f64 },
                    ));
                })
                .await
                .unwrap();
        }
        let tail = store.events_from(&transcript.id, 1).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].uid, "duration:1");
    }

    #[tokio::test]
    async fn test_apply_missing_transcript_errors() {
        let store = memory_store().await;
        let err = store.apply("missing", |_| {}).await.unwrap_err();
        assert!(matches!(err, PersistenceError::TranscriptNotFound(_)));
    }
}
