//! Bucket-bound facade over a [`StorageBackend`]
//!
//! A [`BucketManager`] only exists once its bucket is known to exist (or was
//! just created). Every operation runs against that bucket and logs inside
//! the manager's own tracing span.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{Stream, TryStreamExt};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use walkdir::WalkDir;

use crate::s3::backend::{StorageBackend, MAX_DELETE_BATCH};
use crate::s3::config::DEFAULT_REGION;
use crate::s3::error::{Result, StorageError};
use crate::s3::lister::KeyLister;
use crate::s3::paths;
use crate::s3::types::{DeleteResult, ListingFilter, PresignOptions, PresignedPost, StorageLocator, TransferOptions};

const CONSOLE_URL: &str = "https://s3.console.aws.amazon.com/s3/buckets";

/// How to bind a manager to its bucket
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    pub name: String,
    /// Create the bucket when the account does not have it
    pub create_if_missing: bool,
    /// Region for a newly created bucket and for console links; the
    /// backend's own region is used when absent
    pub region: Option<String>,
    /// Span the manager logs under; one is created when absent
    pub span: Option<Span>,
}

impl BindOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}

/// High-level operations on one bucket
pub struct BucketManager<B: StorageBackend> {
    backend: Arc<B>,
    bucket: String,
    region: String,
    span: Span,
}

impl<B: StorageBackend> Clone for BucketManager<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            span: self.span.clone(),
        }
    }
}

impl<B: StorageBackend> fmt::Debug for BucketManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketManager")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend> BucketManager<B> {
    /// Check the bucket exists, creating it if asked to
    pub async fn bind(backend: Arc<B>, options: BindOptions) -> Result<Self> {
        let BindOptions {
            name,
            create_if_missing,
            region,
            span,
        } = options;

        if name.is_empty() {
            return Err(StorageError::format("bucket name cannot be empty"));
        }

        let span = span.unwrap_or_else(|| info_span!("bucket_manager", bucket = %name));
        let region = region.or_else(|| backend.region().map(str::to_string));

        async {
            let buckets = backend.list_buckets().await?;
            if buckets.iter().any(|b| *b == name) {
                debug!("Bucket exists");
                return Ok(());
            }

            if !create_if_missing {
                return Err(StorageError::not_found(format!("bucket '{}'", name)));
            }

            info!(region = ?region, "Creating bucket");
            backend.create_bucket(&name, region.as_deref()).await
        }
        .instrument(span.clone())
        .await?;

        Ok(Self {
            backend,
            bucket: name,
            region: region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
            span,
        })
    }

    /// Binding again to the same bucket is a no-op; a different bucket needs a new manager
    pub fn rebind(&self, name: &str) -> Result<&Self> {
        if name == self.bucket {
            Ok(self)
        } else {
            Err(StorageError::format(format!(
                "manager is bound to '{}', cannot rebind to '{}'",
                self.bucket, name
            )))
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Key lister over the bound bucket
    pub fn lister(&self) -> KeyLister<'_, B> {
        KeyLister::new(self.backend.as_ref(), &self.bucket)
    }

    /// Lazy stream of matching keys
    pub fn keys(&self, filter: ListingFilter) -> impl Stream<Item = Result<String>> + Send + '_ {
        self.lister().keys(filter)
    }

    /// All matching keys, narrowed by an optional wildcard pattern
    #[tracing::instrument(parent = &self.span, skip_all, fields(prefix = %filter.prefix))]
    pub async fn list(&self, filter: ListingFilter, pattern: Option<&str>) -> Result<Vec<String>> {
        let keys = self.lister().collect(filter, pattern).await?;
        debug!(count = keys.len(), "Listed keys");
        Ok(keys)
    }

    /// Upload raw bytes to `key`
    #[tracing::instrument(parent = &self.span, skip_all, fields(key = %key))]
    pub async fn upload_object(&self, key: &str, body: impl Into<Bytes>, options: &TransferOptions) -> Result<()> {
        check_object_key(key)?;
        let body = body.into();

        info!(size = body.len(), storage_class = %options.storage_class, "Uploading object");
        self.put(key, body, options).await
    }

    /// Upload a local file to `key`
    #[tracing::instrument(parent = &self.span, skip_all, fields(key = %key, path = %local_path.display()))]
    pub async fn upload_file(&self, local_path: &Path, key: &str, options: &TransferOptions) -> Result<()> {
        check_object_key(key)?;

        let size = match tokio::fs::metadata(local_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(StorageError::not_found(format!(
                    "{} is not a regular file",
                    local_path.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(local_path.display().to_string()))
            }
            Err(e) => return Err(StorageError::io(local_path, e)),
        };

        info!(size, "Uploading file");
        self.backend
            .put_file(&self.bucket, key, local_path, options)
            .await
            .map_err(upload_rejected)
    }

    async fn put(&self, key: &str, body: Bytes, options: &TransferOptions) -> Result<()> {
        self.backend
            .put_object(&self.bucket, key, body, options)
            .await
            .map_err(upload_rejected)
    }

    /// Download `key` to a local file or directory, returning the written path
    #[tracing::instrument(parent = &self.span, skip_all, fields(key = %key))]
    pub async fn download_object(&self, key: &str, local_destination: &Path, make_dirs: bool) -> Result<PathBuf> {
        let target = paths::destination_for(key, local_destination)?;

        if make_dirs {
            if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::io(parent, e))?;
            }
        }

        let size = self.backend.download_to_file(&self.bucket, key, &target).await?;

        info!(path = %target.display(), size, "Downloaded object");
        Ok(target)
    }

    /// Download every file under `prefix` into `local_dir`, mirroring the
    /// key structure below the prefix. Stops at the first failure.
    ///
    /// Two keys that would land on the same local path are a `Format`
    /// error, raised before anything is downloaded.
    #[tracing::instrument(parent = &self.span, skip_all, fields(prefix = %prefix, suffix = %suffix))]
    pub async fn download_prefix(&self, local_dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>> {
        let filter = ListingFilter::prefix(prefix).with_suffix(suffix).excluding_folders();
        let keys: Vec<String> = self.keys(filter).try_collect().await?;

        info!(count = keys.len(), dir = %local_dir.display(), "Downloading prefix");

        let mut plans = Vec::with_capacity(keys.len());
        let mut targets = HashSet::with_capacity(keys.len());
        for key in &keys {
            let plan = paths::resolve(key, local_dir, prefix)?;
            if !targets.insert(plan.absolute_path.clone()) {
                return Err(StorageError::format(format!(
                    "'{}' would overwrite another key at {}",
                    key,
                    plan.absolute_path.display()
                )));
            }
            plans.push(plan);
        }

        let mut written = Vec::with_capacity(keys.len());
        for (key, plan) in keys.iter().zip(plans) {
            paths::ensure_directories(local_dir, &plan).await?;
            let size = self
                .backend
                .download_to_file(&self.bucket, key, &plan.absolute_path)
                .await?;

            debug!(key = %key, path = %plan.absolute_path.display(), size, "Downloaded");
            written.push(plan.absolute_path);
        }

        Ok(written)
    }

    /// Upload every file below `local_dir` under `key_prefix`, returning the keys written
    #[tracing::instrument(parent = &self.span, skip_all, fields(dir = %local_dir.display(), prefix = %key_prefix))]
    pub async fn upload_directory(
        &self,
        local_dir: &Path,
        key_prefix: &str,
        options: &TransferOptions,
    ) -> Result<Vec<String>> {
        if !local_dir.is_dir() {
            return Err(StorageError::not_found(format!(
                "{} is not a directory",
                local_dir.display()
            )));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(local_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(local_dir).to_path_buf();
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                StorageError::io(path, source)
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        info!(count = files.len(), "Uploading directory");

        let mut uploaded = Vec::with_capacity(files.len());
        for path in files {
            let relative = path.strip_prefix(local_dir).unwrap_or(&path);
            let key = paths::upload_key(key_prefix, relative);
            self.upload_file(&path, &key, options).await?;
            uploaded.push(key);
        }

        Ok(uploaded)
    }

    #[tracing::instrument(parent = &self.span, skip_all, fields(key = %key))]
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        check_object_key(key)?;
        info!("Deleting object");
        self.backend.delete_object(&self.bucket, key).await
    }

    /// Delete keys in batches of at most [`MAX_DELETE_BATCH`].
    ///
    /// Per-key failures are reported in the result, not as an error. With
    /// `quiet` only failures are reported.
    #[tracing::instrument(parent = &self.span, skip_all, fields(count = keys.len(), quiet = quiet))]
    pub async fn delete_objects(&self, keys: &[String], quiet: bool) -> Result<DeleteResult> {
        let mut result = DeleteResult::default();

        for batch in keys.chunks(MAX_DELETE_BATCH) {
            let batch_result = self.backend.delete_objects(&self.bucket, batch, quiet).await?;
            debug!(
                batch = batch.len(),
                deleted = batch_result.deleted.len(),
                failed = batch_result.errors.len(),
                "Deleted batch"
            );
            result.merge(batch_result);
        }

        if !result.is_success() {
            warn!(failed = result.errors.len(), "Some keys could not be deleted");
        }

        Ok(result)
    }

    /// Delete every key starting with `prefix`
    #[tracing::instrument(parent = &self.span, skip_all, fields(prefix = %prefix))]
    pub async fn delete_by_prefix(&self, prefix: &str, quiet: bool) -> Result<DeleteResult> {
        if prefix.is_empty() {
            return Err(StorageError::format("refusing to delete with an empty prefix"));
        }

        let keys: Vec<String> = self.keys(ListingFilter::prefix(prefix)).try_collect().await?;
        info!(count = keys.len(), "Deleting by prefix");
        self.delete_objects(&keys, quiet).await
    }

    /// Server-side copy of `key` to `destination`; an empty destination key keeps the source key
    #[tracing::instrument(parent = &self.span, skip_all, fields(key = %key, destination = %destination))]
    pub async fn copy_object(&self, key: &str, destination: &StorageLocator) -> Result<()> {
        check_object_key(key)?;
        let dest_key = if destination.key.is_empty() {
            key
        } else {
            destination.key.as_str()
        };

        info!("Copying object");
        self.backend
            .copy_object(&self.bucket, key, &destination.bucket, dest_key)
            .await
    }

    /// Copy `key` to an `s3://bucket/key` URI
    pub async fn copy_uri(&self, key: &str, uri: &str) -> Result<()> {
        let destination = StorageLocator::parse(uri)?;
        self.copy_object(key, &destination).await
    }

    /// Copy every object of the bound bucket to the same key in `dest_bucket`
    #[tracing::instrument(parent = &self.span, skip_all, fields(dest_bucket = %dest_bucket))]
    pub async fn copy_all_to_bucket(&self, dest_bucket: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = self.keys(ListingFilter::default()).try_collect().await?;

        for key in &keys {
            debug!(key = %key, "Copying");
            self.backend.copy_object(&self.bucket, key, dest_bucket, key).await?;
        }

        info!(count = keys.len(), "Copied bucket contents");
        Ok(keys)
    }

    /// Presigned PUT URL for `key`, or `None` when signing fails
    #[tracing::instrument(parent = &self.span, skip_all, fields(key = %key, ttl_secs = ttl.as_secs()))]
    pub async fn generate_upload_url(&self, key: &str, ttl: Duration, options: &PresignOptions) -> Option<String> {
        if let Err(e) = check_object_key(key) {
            warn!(error = %e, "Cannot presign upload");
            return None;
        }

        match self.backend.presign_put(&self.bucket, key, ttl, options).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, "Failed to presign upload");
                None
            }
        }
    }

    /// Presigned PUT URL for `filename` under `key_prefix`
    pub async fn generate_upload_url_in(
        &self,
        key_prefix: &str,
        filename: &str,
        ttl: Duration,
        options: &PresignOptions,
    ) -> Option<String> {
        let key = join_key(key_prefix, filename);
        self.generate_upload_url(&key, ttl, options).await
    }

    /// Signed browser-form upload for `key`, or `None` when signing fails
    #[tracing::instrument(parent = &self.span, skip_all, fields(key = %key, ttl_secs = ttl.as_secs()))]
    pub async fn generate_post_policy(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        conditions: &[serde_json::Value],
        ttl: Duration,
    ) -> Option<PresignedPost> {
        match self
            .backend
            .presign_post(&self.bucket, key, fields, conditions, ttl)
            .await
        {
            Ok(post) => Some(post),
            Err(e) => {
                warn!(error = %e, "Failed to presign POST policy");
                None
            }
        }
    }

    /// AWS console link for `key`
    pub fn console_url(&self, key: &str) -> String {
        format!(
            "{}/{}?region={}&prefix={}/&showversions=false",
            CONSOLE_URL,
            self.bucket,
            self.region,
            key.trim_end_matches('/')
        )
    }
}

fn upload_rejected(e: StorageError) -> StorageError {
    error!(error = %e, "Upload rejected");
    e
}

fn check_object_key(key: &str) -> Result<()> {
    if key.is_empty() {
        Err(StorageError::format("object key cannot be empty"))
    } else {
        Ok(())
    }
}

/// Join with exactly one `/`; an empty prefix yields the bare name
fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
