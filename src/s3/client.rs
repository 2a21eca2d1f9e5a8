//! AWS S3 client wrapper

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration, Delete,
    ObjectCannedAcl, ObjectIdentifier, ServerSideEncryption, StorageClass as S3StorageClass,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::s3::backend::StorageBackend;
use crate::s3::config::{MultipartConfig, S3ClientConfig, DEFAULT_REGION};
use crate::s3::error::{Result, StorageError};
use crate::s3::post_policy::{PostPolicy, SigningCredentials};
use crate::s3::types::{
    DeleteFailure, DeleteResult, ListObjectsPage, PresignOptions, PresignedPost, TransferOptions,
};

/// Characters left as-is in an `x-amz-copy-source` header
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Backend-specific upload parameters understood in `extra`
const SUPPORTED_EXTRAS: &[&str] = &[
    "CacheControl",
    "ContentDisposition",
    "ContentEncoding",
    "ContentLanguage",
    "ServerSideEncryption",
    "SSEKMSKeyId",
    "Tagging",
    "WebsiteRedirectLocation",
];

/// Apply the recognised `extra` parameters to any PutObject-shaped request
macro_rules! apply_extras {
    ($request:expr, $extra:expr) => {{
        let mut request = $request;
        for (name, value) in $extra {
            request = match name.as_str() {
                "CacheControl" => request.cache_control(value),
                "ContentDisposition" => request.content_disposition(value),
                "ContentEncoding" => request.content_encoding(value),
                "ContentLanguage" => request.content_language(value),
                "ServerSideEncryption" => request.server_side_encryption(ServerSideEncryption::from(value.as_str())),
                "SSEKMSKeyId" => request.ssekms_key_id(value),
                "Tagging" => request.tagging(value),
                "WebsiteRedirectLocation" => request.website_redirect_location(value),
                _ => request,
            };
        }
        request
    }};
}

/// Apply storage class, metadata, ACL and content type
macro_rules! apply_transfer_options {
    ($request:expr, $options:expr) => {{
        let options: &TransferOptions = $options;
        let mut request = $request.storage_class(S3StorageClass::from(options.storage_class.as_str()));
        for (name, value) in &options.metadata {
            request = request.metadata(name, value);
        }
        if let Some(content_type) = &options.content_type {
            request = request.content_type(content_type);
        }
        if let Some(acl) = &options.acl {
            request = request.acl(ObjectCannedAcl::from(acl.as_str()));
        }
        apply_extras!(request, &options.extra)
    }};
}

/// Source of an upload body
#[derive(Debug, Clone)]
enum Payload {
    Memory(Bytes),
    File(PathBuf),
}

impl Payload {
    /// Body for `length` bytes starting at `offset`; files are read lazily
    async fn part(&self, offset: u64, length: u64) -> Result<ByteStream> {
        match self {
            Payload::Memory(bytes) => {
                let start = offset as usize;
                Ok(ByteStream::from(bytes.slice(start..start + length as usize)))
            }
            Payload::File(path) => ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| StorageError::io(path, std::io::Error::other(e))),
        }
    }
}

/// S3 client wrapper with high-level operations
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
    current_region: String,
    credentials: Option<SharedCredentialsProvider>,
    endpoint_url: Option<String>,
    force_path_style: bool,
    multipart: MultipartConfig,
}

impl S3Client {
    /// Create a new S3 client for the given profile
    pub async fn new(profile_name: Option<&str>) -> Result<Self> {
        Self::with_config(S3ClientConfig {
            profile: profile_name.map(|p| p.to_string()),
            ..Default::default()
        })
        .await
    }

    /// Create a client from explicit settings
    pub async fn with_config(config: S3ClientConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some((access_key_id, secret_access_key)) = config.static_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "s3-bucket-manager",
            ));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();
        let client = Client::from_conf(s3_config);

        let current_region = sdk_config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        debug!(region = %current_region, endpoint = ?config.endpoint_url, "Created S3 client");

        Ok(Self {
            client,
            current_region,
            credentials: sdk_config.credentials_provider(),
            endpoint_url: config.endpoint_url,
            force_path_style: config.force_path_style,
            multipart: config.multipart,
        })
    }

    /// Get the current region
    pub fn region(&self) -> &str {
        &self.current_region
    }

    /// Where browser forms for `bucket` are posted
    fn post_url(&self, bucket: &str) -> String {
        match &self.endpoint_url {
            Some(endpoint) if self.force_path_style => {
                format!("{}/{}/", endpoint.trim_end_matches('/'), bucket)
            }
            Some(endpoint) => match url::Url::parse(endpoint) {
                Ok(parsed) => match parsed.host_str() {
                    Some(host) => format!("{}://{}.{}/", parsed.scheme(), bucket, host),
                    None => format!("{}/{}/", endpoint.trim_end_matches('/'), bucket),
                },
                Err(_) => format!("{}/{}/", endpoint.trim_end_matches('/'), bucket),
            },
            None => format!("https://{}.s3.{}.amazonaws.com/", bucket, self.current_region),
        }
    }

    async fn put_single(&self, bucket: &str, key: &str, body: ByteStream, options: &TransferOptions) -> Result<()> {
        let request = self.client.put_object().bucket(bucket).key(key).body(body);
        apply_transfer_options!(request, options)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        payload: Payload,
        size: u64,
        options: &TransferOptions,
    ) -> Result<()> {
        let request = self.client.create_multipart_upload().bucket(bucket).key(key);
        let created = apply_transfer_options!(request, options)
            .send()
            .await
            .map_err(sdk_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::backend("MissingUploadId", "CreateMultipartUpload returned no upload id"))?
            .to_string();

        debug!(bucket, key, upload_id = %upload_id, size, "Started multipart upload");

        let parts = match self.upload_parts(bucket, key, &upload_id, payload, size).await {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_multipart(bucket, key, &upload_id).await;
                return Err(e);
            }
        };

        let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
        if let Err(e) = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
        {
            self.abort_multipart(bucket, key, &upload_id).await;
            return Err(sdk_error(e));
        }

        Ok(())
    }

    /// Send every part, at most `max_concurrency` at a time
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        payload: Payload,
        size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let chunk_size = self.multipart.effective_chunk_size() as u64;
        let semaphore = Arc::new(Semaphore::new(self.multipart.effective_concurrency()));
        let mut uploads = JoinSet::new();

        for (index, offset) in (0..size).step_by(chunk_size as usize).enumerate() {
            let part_number = i32::try_from(index + 1)
                .map_err(|_| StorageError::format("object needs more parts than S3 allows"))?;
            let length = chunk_size.min(size - offset);
            let payload = payload.clone();
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| StorageError::backend("Cancelled", e.to_string()))?;

            let client = self.client.clone();
            let bucket = bucket.to_string();
            let key = key.to_string();
            let upload_id = upload_id.to_string();

            uploads.spawn(async move {
                let _permit = permit;
                let body = payload.part(offset, length).await?;
                let output = client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(body)
                    .send()
                    .await
                    .map_err(sdk_error)?;

                Ok::<_, StorageError>(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(output.e_tag().map(|t| t.to_string()))
                        .build(),
                )
            });
        }

        let mut parts = Vec::new();
        while let Some(joined) = uploads.join_next().await {
            let part = joined.map_err(|e| StorageError::backend("PartUploadAborted", e.to_string()))??;
            parts.push(part);
        }
        parts.sort_by_key(|p| p.part_number());

        Ok(parts)
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(bucket, key, upload_id, error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl StorageBackend for S3Client {
    fn region(&self) -> Option<&str> {
        Some(self.current_region.as_str())
    }

    /// List all accessible buckets
    async fn list_buckets(&self) -> Result<Vec<String>> {
        let response = self.client.list_buckets().send().await.map_err(sdk_error)?;

        Ok(response
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(|n| n.to_string()))
            .collect())
    }

    async fn create_bucket(&self, name: &str, region: Option<&str>) -> Result<()> {
        let result = match region.filter(|r| *r != DEFAULT_REGION) {
            Some(region) => {
                let configuration = CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build();
                self.client
                    .create_bucket()
                    .bucket(name)
                    .create_bucket_configuration(configuration)
                    .customize()
                    .config_override(aws_sdk_s3::config::Builder::default().region(Region::new(region.to_string())))
                    .send()
                    .await
            }
            None => self.client.create_bucket().bucket(name).send().await,
        };

        result.map_err(sdk_error)?;
        Ok(())
    }

    /// List one page of keys under a prefix
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: i32,
    ) -> Result<ListObjectsPage> {
        let mut request = self.client.list_objects_v2().bucket(bucket).max_keys(max_keys);

        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }

        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }

        let response = request.send().await.map_err(sdk_error)?;

        let keys = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(|k| k.to_string()))
            .collect();

        let next_token = response.next_continuation_token().map(|s| s.to_string());

        Ok(ListObjectsPage { keys, next_token })
    }

    /// Upload bytes as an object, in parts when large
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes, options: &TransferOptions) -> Result<()> {
        check_extras(&options.extra)?;

        let size = body.len() as u64;
        if self.multipart.is_multipart(size) {
            self.put_multipart(bucket, key, Payload::Memory(body), size, options).await
        } else {
            self.put_single(bucket, key, ByteStream::from(body), options).await
        }
    }

    /// Upload a file, streaming it from disk part by part
    async fn put_file(&self, bucket: &str, key: &str, path: &Path, options: &TransferOptions) -> Result<()> {
        check_extras(&options.extra)?;

        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| StorageError::io(path, e))?
            .len();

        if self.multipart.is_multipart(size) {
            self.put_multipart(bucket, key, Payload::File(path.to_path_buf()), size, options)
                .await
        } else {
            let body = ByteStream::from_path(path)
                .await
                .map_err(|e| StorageError::io(path, std::io::Error::other(e)))?;
            self.put_single(bucket, key, body, options).await
        }
    }

    /// Stream an object into a file. The request is sent before the file is
    /// created, and a partially written file is removed.
    async fn download_to_file(&self, bucket: &str, key: &str, path: &Path) -> Result<u64> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| with_location(sdk_error(e), bucket, key))?;

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        let mut body = response.body.into_async_read();

        match tokio::io::copy(&mut body, &mut file).await {
            Ok(written) => Ok(written),
            Err(e) => {
                drop(file);
                if let Err(remove) = tokio::fs::remove_file(path).await {
                    warn!(path = %path.display(), error = %remove, "Failed to remove partial download");
                }
                Err(StorageError::io(path, e))
            }
        }
    }

    /// Download an object to bytes
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| with_location(sdk_error(e), bucket, key))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::backend("ResponseBody", e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    /// Delete an object
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String], quiet: bool) -> Result<DeleteResult> {
        if keys.is_empty() {
            return Ok(DeleteResult::default());
        }

        let objects: Vec<ObjectIdentifier> = keys
            .iter()
            .map(|k| {
                ObjectIdentifier::builder()
                    .key(k)
                    .build()
                    .map_err(|e| StorageError::format(e.to_string()))
            })
            .collect::<Result<_>>()?;

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(quiet)
            .build()
            .map_err(|e| StorageError::format(e.to_string()))?;

        let response = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(DeleteResult {
            deleted: response
                .deleted()
                .iter()
                .filter_map(|d| d.key().map(|k| k.to_string()))
                .collect(),
            errors: response
                .errors()
                .iter()
                .map(|e| DeleteFailure {
                    key: e.key().unwrap_or_default().to_string(),
                    code: e.code().unwrap_or("Unknown").to_string(),
                    message: e.message().unwrap_or_default().to_string(),
                })
                .collect(),
        })
    }

    /// Server-side copy, no bytes pass through the caller
    async fn copy_object(&self, source_bucket: &str, source_key: &str, dest_bucket: &str, dest_key: &str) -> Result<()> {
        let copy_source = format!("{}/{}", source_bucket, utf8_percent_encode(source_key, COPY_SOURCE));

        self.client
            .copy_object()
            .bucket(dest_bucket)
            .key(dest_key)
            .copy_source(copy_source)
            .send()
            .await
            .map_err(|e| with_location(sdk_error(e), source_bucket, source_key))?;

        Ok(())
    }

    async fn presign_put(&self, bucket: &str, key: &str, expires_in: Duration, options: &PresignOptions) -> Result<String> {
        check_extras(&options.extra)?;

        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::format(format!("invalid presign expiry: {}", e)))?;

        let mut request = self.client.put_object().bucket(bucket).key(key);
        for (name, value) in &options.metadata {
            request = request.metadata(name, value);
        }
        if let Some(content_type) = &options.content_type {
            request = request.content_type(content_type);
        }
        if let Some(acl) = &options.acl {
            request = request.acl(ObjectCannedAcl::from(acl.as_str()));
        }
        let request = apply_extras!(request, &options.extra);

        let presigned = request.presigned(presigning).await.map_err(sdk_error)?;
        Ok(presigned.uri().to_string())
    }

    async fn presign_post(
        &self,
        bucket: &str,
        key: &str,
        fields: &BTreeMap<String, String>,
        conditions: &[serde_json::Value],
        expires_in: Duration,
    ) -> Result<PresignedPost> {
        let provider = self
            .credentials
            .as_ref()
            .ok_or_else(|| StorageError::backend("MissingCredentials", "no credentials provider is configured"))?;
        let credentials = provider
            .provide_credentials()
            .await
            .map_err(|e| StorageError::backend("CredentialsError", DisplayErrorContext(&e).to_string()))?;

        let signing = SigningCredentials {
            access_key_id: credentials.access_key_id(),
            secret_access_key: credentials.secret_access_key(),
            session_token: credentials.session_token(),
        };

        PostPolicy::new(bucket, key, expires_in)
            .fields(fields.clone())
            .conditions(conditions.to_vec())
            .sign(&signing, &self.current_region, chrono::Utc::now(), self.post_url(bucket))
    }
}

/// Reject `extra` parameters this client would otherwise drop silently
fn check_extras(extra: &BTreeMap<String, String>) -> Result<()> {
    match extra.keys().find(|name| !SUPPORTED_EXTRAS.contains(&name.as_str())) {
        Some(name) => Err(StorageError::format(format!(
            "unsupported upload parameter '{}'; expected one of {}",
            name,
            SUPPORTED_EXTRAS.join(", ")
        ))),
        None => Ok(()),
    }
}

/// Map an SDK failure onto the error taxonomy, keeping code and message
fn sdk_error<E, R>(err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = match err.code() {
        Some(code) => code.to_string(),
        None => match &err {
            SdkError::TimeoutError(_) => "Timeout",
            SdkError::DispatchFailure(_) => "DispatchFailure",
            SdkError::ResponseError(_) => "ResponseError",
            SdkError::ConstructionFailure(_) => "ConstructionFailure",
            _ => "Unknown",
        }
        .to_string(),
    };
    let message = err
        .message()
        .map(|m| m.to_string())
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());

    match code.as_str() {
        "NoSuchKey" | "NoSuchBucket" | "NotFound" => StorageError::NotFound(format!("{} ({})", message, code)),
        _ => StorageError::Backend { code, message },
    }
}

/// Name the object in not-found errors
fn with_location(err: StorageError, bucket: &str, key: &str) -> StorageError {
    match err {
        StorageError::NotFound(detail) => StorageError::NotFound(format!("s3://{}/{}: {}", bucket, key, detail)),
        other => other,
    }
}
