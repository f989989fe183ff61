//! S3-backed object store.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

use reflector_config::StorageSettings;

use crate::{ObjectInfo, ObjectStore, PresignOperation, StorageError};

pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    /// Build a client from the ambient AWS environment plus settings
    /// (region, optional custom endpoint for S3-compatible stores).
    pub async fn connect(settings: &StorageSettings) -> Self {
        let mut loader = aws_config::from_env()
            .region(aws_sdk_s3::config::Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let config = loader.load().await;
        tracing::info!(region = %settings.region, "Connected to S3");
        Self {
            client: Client::new(&config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn presign_config(ttl: Duration) -> Result<PresigningConfig, StorageError> {
        PresigningConfig::expires_in(ttl).map_err(|e| StorageError::Permanent(e.to_string()))
    }
}

/// Map an SDK error onto the storage taxonomy using the HTTP status when the
/// service responded, `Transient` for timeouts and connection failures.
fn map_sdk_error<E, R>(err: SdkError<E, R>, bucket: &str, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + HttpStatus,
{
    match &err {
        SdkError::ServiceError(service) => match service.raw().status_code() {
            Some(404) => StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            Some(403) => StorageError::Forbidden(err.to_string()),
            Some(status) if status >= 500 => StorageError::Transient(err.to_string()),
            Some(429) => StorageError::Transient(err.to_string()),
            _ => StorageError::Permanent(err.to_string()),
        },
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StorageError::Transient(err.to_string())
        }
        _ => StorageError::Permanent(err.to_string()),
    }
}

/// Narrow view over the SDK's raw response types so the error mapper does not
/// depend on a concrete response generic.
trait HttpStatus {
    fn status_code(&self) -> Option<u16>;
}

impl HttpStatus for aws_sdk_s3::config::http::HttpResponse {
    fn status_code(&self) -> Option<u16> {
        Some(self.status().as_u16())
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    async fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        op: PresignOperation,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let config = Self::presign_config(ttl)?;
        let url = match op {
            PresignOperation::Get => self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .presigned(config)
                .await
                .map_err(|e| map_sdk_error(e, bucket, key))?
                .uri()
                .to_string(),
            PresignOperation::Put => self
                .client
                .put_object()
                .bucket(bucket)
                .key(key)
                .presigned(config)
                .await
                .map_err(|e| map_sdk_error(e, bucket, key))?
                .uri()
                .to_string(),
        };
        Ok(url)
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, key))?;
        Ok(())
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), StorageError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::Permanent(e.to_string()))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, key))?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, key))?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(data.into_bytes())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        // S3 DeleteObject on a missing key already returns success.
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, key))?;
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, key))?;
        Ok(ObjectInfo {
            size: output.content_length().map(|s| s as u64),
        })
    }
}
