//! Uniform task execution: timeout, bounded retries, failure status, keyed
//! concurrency, and durable checkpoints.
//!
//! Each task declares a [`TaskPolicy`]. Completed outputs are recorded as
//! JSON keyed by `(workflow_run_id, task_name)`; re-driving a run replays
//! recorded outputs instead of re-executing, so a worker crash never repeats
//! side effects (including progress events) of tasks that already finished.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use reflector_core::TranscriptStatus;
use reflector_persistence::{TaskCheckpoints, TranscriptStore};

use crate::progress::{set_status_and_broadcast, ProgressBus};
use crate::PipelineError;

/// Process-wide keyed semaphores; `max_runs` applies across every pipeline
/// in the process, so overlapping runs queue instead of competing.
static CONCURRENCY: Lazy<DashMap<&'static str, Arc<Semaphore>>> = Lazy::new(DashMap::new);

async fn acquire(key: &'static str, max_runs: usize) -> OwnedSemaphorePermit {
    let semaphore = CONCURRENCY
        .entry(key)
        .or_insert_with(|| Arc::new(Semaphore::new(max_runs)))
        .clone();
    semaphore
        .acquire_owned()
        .await
        .expect("concurrency semaphore closed")
}

#[derive(Debug, Clone)]
pub struct TaskPolicy {
    pub name: &'static str,
    pub timeout: Duration,
    pub attempts: u32,
    pub set_error_status: bool,
    pub concurrency_key: Option<(&'static str, usize)>,
}

impl TaskPolicy {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            attempts: 3,
            set_error_status: true,
            concurrency_key: None,
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Post-finalize notification tasks opt out of flipping the transcript
    /// into `error`.
    pub fn non_fatal(mut self) -> Self {
        self.set_error_status = false;
        self
    }

    pub fn serialized_on(mut self, key: &'static str, max_runs: usize) -> Self {
        self.concurrency_key = Some((key, max_runs));
        self
    }
}

#[derive(Clone)]
pub struct TaskRunner {
    store: TranscriptStore,
    checkpoints: TaskCheckpoints,
    bus: ProgressBus,
    run_id: String,
    transcript_id: String,
}

impl TaskRunner {
    pub fn new(
        store: TranscriptStore,
        checkpoints: TaskCheckpoints,
        bus: ProgressBus,
        run_id: impl Into<String>,
        transcript_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            checkpoints,
            bus,
            run_id: run_id.into(),
            transcript_id: transcript_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute `task` under `policy`. The closure is re-invoked per attempt;
    /// a checkpointed output short-circuits execution entirely.
    pub async fn run<T, F, Fut>(&self, policy: &TaskPolicy, task: F) -> Result<T, PipelineError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        if let Some(output) = self.checkpoints.get(&self.run_id, policy.name).await? {
            tracing::info!(
                task = policy.name,
                transcript_id = %self.transcript_id,
                "replaying checkpointed task output"
            );
            return Ok(serde_json::from_value(output)?);
        }

        let _permit = match policy.concurrency_key {
            Some((key, max_runs)) => Some(acquire(key, max_runs).await),
            None => None,
        };

        let mut backoff = Duration::from_secs(1);
        let mut last_error: Option<PipelineError> = None;
        for attempt in 1..=policy.attempts.max(1) {
            if attempt > 1 {
                tracing::warn!(
                    task = policy.name,
                    transcript_id = %self.transcript_id,
                    attempt,
                    max = policy.attempts,
                    "retrying task"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match tokio::time::timeout(policy.timeout, task()).await {
                Ok(Ok(value)) => {
                    self.checkpoints
                        .record(&self.run_id, policy.name, &serde_json::to_value(&value)?)
                        .await?;
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        task = policy.name,
                        transcript_id = %self.transcript_id,
                        error = %e,
                        "task attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(_) => {
                    last_error = Some(PipelineError::Timeout {
                        task: policy.name.to_string(),
                        seconds: policy.timeout.as_secs(),
                    });
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| PipelineError::Task(format!("{} produced no attempts", policy.name)));
        if policy.set_error_status {
            self.set_error_status().await;
        }
        Err(err)
    }

    /// Flip the transcript to `error`; also used by the workflow-level
    /// failure hook when no task context is alive to do it.
    pub async fn set_error_status(&self) {
        if let Err(e) = set_status_and_broadcast(
            &self.store,
            &self.bus,
            &self.transcript_id,
            TranscriptStatus::Error,
        )
        .await
        {
            tracing::error!(
                transcript_id = %self.transcript_id,
                error = %e,
                "failed to set error status, transcript may be stuck in processing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use reflector_core::Transcript;
    use reflector_persistence::TaskCheckpoints;

    async fn runner() -> (TaskRunner, TranscriptStore, String) {
        let store = TranscriptStore::connect("sqlite::memory:").await.unwrap();
        let transcript = store.create(Transcript::new("t")).await.unwrap();
        let checkpoints = TaskCheckpoints::new(store.pool().clone());
        let bus = ProgressBus::new(store.clone());
        let id = transcript.id.clone();
        (
            TaskRunner::new(store.clone(), checkpoints, bus, "run-1", &id),
            store,
            id,
        )
    }

    fn quick(name: &'static str) -> TaskPolicy {
        TaskPolicy::new(name, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_success_records_checkpoint_and_replays() {
        let (runner, _store, _id) = runner().await;
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let out: u32 = runner
                .run(&quick("count"), move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(7u32)
                    }
                })
                .await
                .unwrap();
            assert_eq!(out, 7);
        }
        // Second run replayed the checkpoint; the task body ran once.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let (runner, store, id) = runner().await;
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let out: String = runner
            .run(&quick("flaky"), move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(PipelineError::Task("first attempt fails".into()))
                    } else {
                        Ok("ok".to_string())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // A recovered task leaves the transcript untouched.
        let t = store.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(t.status, TranscriptStatus::Idle);
    }

    #[tokio::test]
    async fn test_exhausted_retries_set_error_status() {
        let (runner, store, id) = runner().await;

        let result: Result<(), _> = runner
            .run(&quick("doomed").attempts(2), || async {
                Err(PipelineError::Task("always fails".into()))
            })
            .await;

        assert!(result.is_err());
        let t = store.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(t.status, TranscriptStatus::Error);
    }

    #[tokio::test]
    async fn test_non_fatal_task_leaves_status_alone() {
        let (runner, store, id) = runner().await;

        let result: Result<(), _> = runner
            .run(&quick("notify").attempts(1).non_fatal(), || async {
                Err(PipelineError::Task("chat is down".into()))
            })
            .await;

        assert!(result.is_err());
        let t = store.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(t.status, TranscriptStatus::Idle);
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let (runner, _store, _id) = runner().await;
        let policy = TaskPolicy::new("slow", Duration::from_millis(20)).attempts(1);

        let result: Result<(), _> = runner
            .run(&policy, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_concurrency_key_serializes_runs() {
        let (runner, _store, _id) = runner().await;
        let live = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..3 {
            let runner = runner.clone();
            let live = live.clone();
            let peak = peak.clone();
            // Distinct task names so checkpoints do not collapse the runs.
            let name: &'static str = ["m0", "m1", "m2"][i];
            handles.push(tokio::spawn(async move {
                let policy = quick(name).serialized_on("mixdown-test", 1);
                runner
                    .run(&policy, move || {
                        let live = live.clone();
                        let peak = peak.clone();
                        async move {
                            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            live.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
