//! Durable task checkpoints and meeting consent records.

use sqlx::{Row, SqlitePool};

use crate::PersistenceError;

const CREATE_TASKS: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_task (
    run_id TEXT NOT NULL,
    task_name TEXT NOT NULL,
    output TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    PRIMARY KEY (run_id, task_name)
)
"#;

const CREATE_CONSENT: &str = r#"
CREATE TABLE IF NOT EXISTS meeting_consent (
    meeting_id TEXT NOT NULL,
    participant_id TEXT NOT NULL,
    approved INTEGER NOT NULL,
    PRIMARY KEY (meeting_id, participant_id)
)
"#;

pub(crate) async fn ensure_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_TASKS).execute(pool).await?;
    sqlx::query(CREATE_CONSENT).execute(pool).await?;
    Ok(())
}

/// Completed task outputs keyed by `(workflow_run_id, task_name)`.
///
/// Re-driving a workflow after a worker crash replays these outputs instead
/// of re-executing the tasks, which also keeps already-published progress
/// events from being emitted twice.
#[derive(Clone)]
pub struct TaskCheckpoints {
    pool: SqlitePool,
}

impl TaskCheckpoints {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        run_id: &str,
        task_name: &str,
    ) -> Result<Option<serde_json::Value>, PersistenceError> {
        let row = sqlx::query("SELECT output FROM workflow_task WHERE run_id = ? AND task_name = ?")
            .bind(run_id)
            .bind(task_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let raw: String = r.try_get("output")?;
            serde_json::from_str(&raw).map_err(PersistenceError::from)
        })
        .transpose()
    }

    pub async fn record(
        &self,
        run_id: &str,
        task_name: &str,
        output: &serde_json::Value,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"INSERT INTO workflow_task (run_id, task_name, output, completed_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (run_id, task_name) DO UPDATE SET
                   output = excluded.output, completed_at = excluded.completed_at"#,
        )
        .bind(run_id)
        .bind(task_name)
        .bind(serde_json::to_string(output)?)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop every checkpoint of a finished run.
    pub async fn clear_run(&self, run_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM workflow_task WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Per-meeting consent flags. Approval is the default; a single denial
/// triggers audio cleanup.
#[derive(Clone)]
pub struct ConsentStore {
    pool: SqlitePool,
}

impl ConsentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        meeting_id: &str,
        participant_id: &str,
        approved: bool,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"INSERT INTO meeting_consent (meeting_id, participant_id, approved)
               VALUES (?, ?, ?)
               ON CONFLICT (meeting_id, participant_id) DO UPDATE SET
                   approved = excluded.approved"#,
        )
        .bind(meeting_id)
        .bind(participant_id)
        .bind(approved as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn has_any_denial(&self, meeting_id: &str) -> Result<bool, PersistenceError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS denials FROM meeting_consent WHERE meeting_id = ? AND approved = 0",
        )
        .bind(meeting_id)
        .fetch_one(&self.pool)
        .await?;
        let denials: i64 = row.try_get("denials")?;
        Ok(denials > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TranscriptStore;

    async fn pool() -> SqlitePool {
        TranscriptStore::connect("sqlite::memory:")
            .await
            .unwrap()
            .pool()
            .clone()
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip_and_overwrite() {
        let checkpoints = TaskCheckpoints::new(pool().await);
        assert!(checkpoints.get("run", "mixdown").await.unwrap().is_none());

        checkpoints
            .record("run", "mixdown", &serde_json::json!({"duration": 1000.0}))
            .await
            .unwrap();
        let loaded = checkpoints.get("run", "mixdown").await.unwrap().unwrap();
        assert_eq!(loaded["duration"], 1000.0);

        checkpoints
            .record("run", "mixdown", &serde_json::json!({"duration": 2000.0}))
            .await
            .unwrap();
        let loaded = checkpoints.get("run", "mixdown").await.unwrap().unwrap();
        assert_eq!(loaded["duration"], 2000.0);
    }

    #[tokio::test]
    async fn test_clear_run_drops_checkpoints() {
        let checkpoints = TaskCheckpoints::new(pool().await);
        checkpoints
            .record("run", "a", &serde_json::json!(1))
            .await
            .unwrap();
        checkpoints.clear_run("run").await.unwrap();
        assert!(checkpoints.get("run", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consent_default_is_approved() {
        let consent = ConsentStore::new(pool().await);
        assert!(!consent.has_any_denial("meeting").await.unwrap());

        consent.record("meeting", "alice", true).await.unwrap();
        assert!(!consent.has_any_denial("meeting").await.unwrap());

        consent.record("meeting", "bob", false).await.unwrap();
        assert!(consent.has_any_denial("meeting").await.unwrap());
    }
}
