//! In-memory storage backend
//!
//! Behaves like S3 for the operations the manager uses: lexicographic
//! key order, paged listings with continuation tokens, per-key delete
//! errors. Failures can be injected to exercise error paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::s3::backend::StorageBackend;
use crate::s3::error::{Result, StorageError};
use crate::s3::types::{DeleteFailure, DeleteResult, ListObjectsPage, PresignOptions, PresignedPost, TransferOptions};

/// An object held by [`MemoryBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub options: TransferOptions,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    /// Names taken by someone else's account
    foreign_buckets: BTreeSet<String>,
    /// Keys whose delete reports AccessDenied
    protected_keys: BTreeSet<String>,
    /// Keys whose get fails with a backend error
    unreadable_keys: BTreeSet<String>,
    fail_presign: bool,
    create_bucket_calls: usize,
    /// Region requested for each created bucket
    bucket_regions: BTreeMap<String, Option<String>>,
    list_calls: usize,
    delete_batches: Vec<usize>,
}

/// Storage backend kept entirely in process memory
#[derive(Debug)]
pub struct MemoryBackend {
    page_size: usize,
    region: Option<String>,
    state: Mutex<State>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    /// Backend returning at most `page_size` keys per listing page
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            region: None,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Report `region` as the backend's configured region
    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    /// Add an empty bucket
    pub fn with_bucket(self, name: &str) -> Self {
        self.state().buckets.entry(name.to_string()).or_default();
        self
    }

    /// Store raw bytes, creating the bucket if needed
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.state().buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                options: TransferOptions::default(),
            },
        );
    }

    /// Mark a bucket name as owned by another account
    pub fn reserve_foreign_bucket(&self, name: &str) {
        self.state().foreign_buckets.insert(name.to_string());
    }

    pub fn protect_key(&self, key: &str) {
        self.state().protected_keys.insert(key.to_string());
    }

    pub fn make_unreadable(&self, key: &str) {
        self.state().unreadable_keys.insert(key.to_string());
    }

    pub fn fail_presign(&self, fail: bool) {
        self.state().fail_presign = fail;
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state().buckets.get(bucket).and_then(|objects| objects.get(key)).cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn create_bucket_calls(&self) -> usize {
        self.state().create_bucket_calls
    }

    /// Region passed to `create_bucket` for `name`, if it was created here
    pub fn created_region(&self, name: &str) -> Option<Option<String>> {
        self.state().bucket_regions.get(name).cloned()
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    /// Sizes of the DeleteObjects batches received, in order
    pub fn delete_batches(&self) -> Vec<usize> {
        self.state().delete_batches.clone()
    }
}

fn no_such_bucket(bucket: &str) -> StorageError {
    StorageError::not_found(format!("bucket '{}'", bucket))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    async fn list_buckets(&self) -> Result<Vec<String>> {
        Ok(self.state().buckets.keys().cloned().collect())
    }

    async fn create_bucket(&self, name: &str, region: Option<&str>) -> Result<()> {
        let mut state = self.state();
        state.create_bucket_calls += 1;

        if state.foreign_buckets.contains(name) {
            return Err(StorageError::backend(
                "BucketAlreadyExists",
                "The requested bucket name is not available.",
            ));
        }
        if state.buckets.contains_key(name) {
            return Err(StorageError::backend(
                "BucketAlreadyOwnedByYou",
                "Your previous request to create the named bucket succeeded and you already own it.",
            ));
        }

        state.buckets.insert(name.to_string(), BTreeMap::new());
        state.bucket_regions.insert(name.to_string(), region.map(str::to_string));
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: i32,
    ) -> Result<ListObjectsPage> {
        let mut state = self.state();
        state.list_calls += 1;

        let objects = state.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        let limit = usize::try_from(max_keys).unwrap_or(1).clamp(1, self.page_size);

        // The token is the last key of the previous page
        let mut matching = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| continuation_token.map_or(true, |token| k.as_str() > token));

        let keys: Vec<String> = matching.by_ref().take(limit).cloned().collect();
        let next_token = if matching.next().is_some() {
            keys.last().cloned()
        } else {
            None
        };

        Ok(ListObjectsPage { keys, next_token })
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes, options: &TransferOptions) -> Result<()> {
        let mut state = self.state();
        let objects = state.buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data: body.to_vec(),
                options: options.clone(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let state = self.state();
        if state.unreadable_keys.contains(key) {
            return Err(StorageError::backend("AccessDenied", "Access Denied"));
        }
        let objects = state.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::not_found(format!("s3://{}/{}", bucket, key)))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let mut state = self.state();
        if state.protected_keys.contains(key) {
            return Err(StorageError::backend("AccessDenied", "Access Denied"));
        }
        let objects = state.buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        // S3 deletes are idempotent
        objects.remove(key);
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String], quiet: bool) -> Result<DeleteResult> {
        let mut state = self.state();
        state.delete_batches.push(keys.len());

        let protected = state.protected_keys.clone();
        let objects = state.buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;

        let mut result = DeleteResult::default();
        for key in keys {
            if protected.contains(key) {
                result.errors.push(DeleteFailure {
                    key: key.clone(),
                    code: "AccessDenied".to_string(),
                    message: "Access Denied".to_string(),
                });
                continue;
            }
            objects.remove(key);
            if !quiet {
                result.deleted.push(key.clone());
            }
        }
        Ok(result)
    }

    async fn copy_object(&self, source_bucket: &str, source_key: &str, dest_bucket: &str, dest_key: &str) -> Result<()> {
        let mut state = self.state();
        let object = state
            .buckets
            .get(source_bucket)
            .ok_or_else(|| no_such_bucket(source_bucket))?
            .get(source_key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("s3://{}/{}", source_bucket, source_key)))?;

        state
            .buckets
            .get_mut(dest_bucket)
            .ok_or_else(|| no_such_bucket(dest_bucket))?
            .insert(dest_key.to_string(), object);
        Ok(())
    }

    async fn presign_put(&self, bucket: &str, key: &str, expires_in: Duration, _options: &PresignOptions) -> Result<String> {
        if self.state().fail_presign {
            return Err(StorageError::backend("SignatureDoesNotMatch", "presigning rejected"));
        }
        Ok(format!("memory://{}/{}?method=PUT&expires={}", bucket, key, expires_in.as_secs()))
    }

    async fn presign_post(
        &self,
        bucket: &str,
        key: &str,
        fields: &BTreeMap<String, String>,
        _conditions: &[serde_json::Value],
        _expires_in: Duration,
    ) -> Result<PresignedPost> {
        if self.state().fail_presign {
            return Err(StorageError::backend("SignatureDoesNotMatch", "presigning rejected"));
        }
        let mut all_fields = fields.clone();
        all_fields.insert("key".to_string(), key.to_string());
        Ok(PresignedPost {
            url: format!("memory://{}/", bucket),
            fields: all_fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listing_pages_use_continuation_tokens() {
        let backend = MemoryBackend::with_page_size(2);
        for key in ["a", "b", "c", "d", "e"] {
            backend.insert("bucket", key, b"x".to_vec());
        }

        let first = backend.list_objects("bucket", "", None, 1000).await.unwrap();
        assert_eq!(first.keys, vec!["a", "b"]);
        assert_eq!(first.next_token.as_deref(), Some("b"));

        let second = backend.list_objects("bucket", "", first.next_token.as_deref(), 1000).await.unwrap();
        assert_eq!(second.keys, vec!["c", "d"]);

        let third = backend.list_objects("bucket", "", second.next_token.as_deref(), 1000).await.unwrap();
        assert_eq!(third.keys, vec!["e"]);
        assert!(third.next_token.is_none());
    }

    #[tokio::test]
    async fn test_create_bucket_rejects_foreign_name() {
        let backend = MemoryBackend::new();
        backend.reserve_foreign_bucket("taken");

        let err = backend.create_bucket("taken", None).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend { ref code, .. } if code == "BucketAlreadyExists"));
        assert_eq!(backend.create_bucket_calls(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_key_is_not_found() {
        let backend = MemoryBackend::new().with_bucket("bucket");
        let err = backend.get_object("bucket", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_copy_object_between_buckets() {
        let backend = MemoryBackend::new().with_bucket("dst");
        backend.insert("src", "k", b"payload".to_vec());

        backend.copy_object("src", "k", "dst", "k2").await.unwrap();
        assert_eq!(backend.object("dst", "k2").unwrap().data, b"payload".to_vec());
    }
}
