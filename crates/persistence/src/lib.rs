//! Persistent store for transcript aggregates and durable task state.
//!
//! Backed by SQLite through sqlx. A single pooled connection plus an
//! in-process write lock serialize every mutation, so the `events` append
//! order is exactly the commit order and two workers can never observe
//! different prefixes of the event log.

mod store;
mod tasks;

pub use store::TranscriptStore;
pub use tasks::{ConsentStore, TaskCheckpoints};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("transcript not found: {0}")]
    TranscriptNotFound(String),
}
