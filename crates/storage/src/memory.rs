//! In-process object store used by tests and local development.
//!
//! Objects spill to a scratch directory so "presigned URLs" are plain
//! filesystem paths, which the audio codec can open like any other source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::{ObjectInfo, ObjectStore, PresignOperation, StorageError};

pub struct MemoryStorage {
    root: tempfile::TempDir,
    objects: Mutex<HashMap<(String, String), u64>>,
}

impl MemoryStorage {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            root: tempfile::tempdir()?,
            objects: Mutex::new(HashMap::new()),
        })
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.path().join(bucket).join(key)
    }

    pub async fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .await
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Keys currently stored in `bucket`.
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStorage {
    async fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        _op: PresignOperation,
        _ttl: Duration,
    ) -> Result<String, StorageError> {
        Ok(self.object_path(bucket, key).to_string_lossy().into_owned())
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Permanent(e.to_string()))?;
        }
        let size = body.len() as u64;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| StorageError::Permanent(e.to_string()))?;
        self.objects
            .lock()
            .await
            .insert((bucket.to_string(), key.to_string()), size);
        Ok(())
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), StorageError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::Permanent(e.to_string()))?;
        self.put(bucket, key, Bytes::from(body)).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        if !self.contains(bucket, key).await {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        let body = tokio::fs::read(self.object_path(bucket, key))
            .await
            .map_err(|e| StorageError::Permanent(e.to_string()))?;
        Ok(Bytes::from(body))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let removed = self
            .objects
            .lock()
            .await
            .remove(&(bucket.to_string(), key.to_string()));
        if removed.is_some() {
            let _ = tokio::fs::remove_file(self.object_path(bucket, key)).await;
        }
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        let objects = self.objects.lock().await;
        match objects.get(&(bucket.to_string(), key.to_string())) {
            Some(size) => Ok(ObjectInfo { size: Some(*size) }),
            None => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let storage = MemoryStorage::new().unwrap();
        storage
            .put("bucket", "a/b.bin", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let body = storage.get("bucket", "a/b.bin").await.unwrap();
        assert_eq!(&body[..], b"hello");
        let info = storage.head("bucket", "a/b.bin").await.unwrap();
        assert_eq!(info.size, Some(5));
    }

    #[tokio::test]
    async fn test_delete_missing_key_succeeds() {
        let storage = MemoryStorage::new().unwrap();
        assert!(storage.delete("bucket", "nope").await.is_ok());
    }

    #[tokio::test]
    async fn test_get_missing_key_is_not_found() {
        let storage = MemoryStorage::new().unwrap();
        let err = storage.get("bucket", "nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_presigned_url_is_a_readable_path() {
        let storage = MemoryStorage::new().unwrap();
        storage
            .put("bucket", "track.webm", Bytes::from_static(b"data"))
            .await
            .unwrap();
        let url = storage
            .presigned_url(
                "bucket",
                "track.webm",
                PresignOperation::Get,
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(url).unwrap(), b"data");
    }
}
