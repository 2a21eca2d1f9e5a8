//! Connection and transfer settings for [`crate::s3::S3Client`]

/// Region assumed when neither the config nor the environment names one
pub const DEFAULT_REGION: &str = "us-east-1";

/// Payloads above this size are sent as multipart uploads
pub const DEFAULT_MULTIPART_THRESHOLD: usize = 25 * 1024 * 1024;

pub const DEFAULT_MULTIPART_CHUNK_SIZE: usize = 25 * 1024 * 1024;

/// Parts in flight at once during a multipart upload
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// S3 rejects smaller parts (except the last one)
pub const MIN_MULTIPART_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// How large uploads are split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartConfig {
    pub threshold: usize,
    pub chunk_size: usize,
    pub max_concurrency: usize,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MULTIPART_THRESHOLD,
            chunk_size: DEFAULT_MULTIPART_CHUNK_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl MultipartConfig {
    /// Chunk size raised to the S3 minimum
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(MIN_MULTIPART_CHUNK_SIZE)
    }

    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    pub fn is_multipart(&self, len: u64) -> bool {
        len > self.threshold as u64
    }
}

/// How to reach S3 and with which identity.
///
/// Credentials are either given as static keys or left to the AWS SDK's
/// default chain (environment, profile, instance role).
#[derive(Debug, Clone, Default)]
pub struct S3ClientConfig {
    /// Named profile from the shared AWS config
    pub profile: Option<String>,
    /// Custom endpoint, e.g. a MinIO server
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub multipart: MultipartConfig,
}

impl S3ClientConfig {
    /// Static keys, only when both halves are present
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => Some((id.as_str(), secret.as_str())),
            _ => None,
        }
    }
}
