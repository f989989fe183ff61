//! Byte-oriented object storage on `(bucket, key)`.
//!
//! The pipeline never carries presigned URLs across task boundaries; it
//! carries `(bucket, key)` and presigns at the consumer, because presigned
//! URLs embed a time bound that is likely shorter than workflow latency.

mod memory;
mod s3;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use memory::MemoryStorage;
pub use s3::S3Storage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("access denied: {0}")]
    Forbidden(String),
    /// 5xx or timeout; the caller may retry.
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignOperation {
    Get,
    Put,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub size: Option<u64>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Time-limited URL consumable by external services.
    async fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        op: PresignOperation,
        ttl: Duration,
    ) -> Result<String, StorageError>;

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError>;

    /// Upload from a local file, streaming the handle rather than buffering
    /// the payload whole.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), StorageError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError>;

    /// Idempotent: deleting a missing key succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError>;
}
