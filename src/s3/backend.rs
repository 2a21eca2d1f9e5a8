//! The remote storage API the bucket manager talks to

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::s3::error::{Result, StorageError};
use crate::s3::types::{DeleteResult, ListObjectsPage, PresignOptions, PresignedPost, TransferOptions};

/// Largest page S3 returns from ListObjectsV2
pub const MAX_KEYS_PER_PAGE: i32 = 1000;

/// Largest key count S3 accepts in one DeleteObjects call
pub const MAX_DELETE_BATCH: usize = 1000;

/// Request/response object storage.
///
/// Retries, multipart chunking and authentication live behind this trait.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Region the backend is configured for, if it has one
    fn region(&self) -> Option<&str> {
        None
    }

    /// Names of all buckets visible to the credentials
    async fn list_buckets(&self) -> Result<Vec<String>>;

    /// Create a bucket, in `region` when given
    async fn create_bucket(&self, name: &str, region: Option<&str>) -> Result<()>;

    /// One page of keys under `prefix`
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: i32,
    ) -> Result<ListObjectsPage>;

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes, options: &TransferOptions) -> Result<()>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Upload the file at `path`. The default reads it whole; remote
    /// backends override this to stream from disk.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path, options: &TransferOptions) -> Result<()> {
        let body = tokio::fs::read(path).await.map_err(|e| StorageError::io(path, e))?;
        self.put_object(bucket, key, Bytes::from(body), options).await
    }

    /// Write the object to `path`, returning the byte count. Nothing is
    /// created at `path` when the object cannot be fetched.
    async fn download_to_file(&self, bucket: &str, key: &str, path: &Path) -> Result<u64> {
        let data = self.get_object(bucket, key).await?;
        tokio::fs::write(path, &data).await.map_err(|e| StorageError::io(path, e))?;
        Ok(data.len() as u64)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Delete up to [`MAX_DELETE_BATCH`] keys in one call
    async fn delete_objects(&self, bucket: &str, keys: &[String], quiet: bool) -> Result<DeleteResult>;

    /// Server-side copy
    async fn copy_object(&self, source_bucket: &str, source_key: &str, dest_bucket: &str, dest_key: &str) -> Result<()>;

    /// Presigned URL for a single PUT
    async fn presign_put(&self, bucket: &str, key: &str, expires_in: Duration, options: &PresignOptions) -> Result<String>;

    /// Presigned browser-form POST
    async fn presign_post(
        &self,
        bucket: &str,
        key: &str,
        fields: &BTreeMap<String, String>,
        conditions: &[serde_json::Value],
        expires_in: Duration,
    ) -> Result<PresignedPost>;
}
