//! S3 data types

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::s3::error::{Result, StorageError};

const S3_SCHEME: &str = "s3://";

/// One remote object: a bucket and a key inside it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocator {
    pub bucket: String,
    pub key: String,
}

impl StorageLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse an `s3://bucket/key` URI.
    ///
    /// The key is everything after the first `/` and may be empty.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(S3_SCHEME)
            .ok_or_else(|| StorageError::format(format!("'{}' must start with '{}'", uri, S3_SCHEME)))?;

        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(StorageError::format(format!("'{}' has no bucket name", uri)));
        }

        Ok(Self::new(bucket, key))
    }

    /// Parse an S3 URL (supports s3:// and https:// formats)
    pub fn parse_url(url: &str) -> Result<Self> {
        if url.starts_with(S3_SCHEME) {
            return Self::parse(url);
        }

        let invalid = || StorageError::format(format!("'{}' is not an S3 URL", url));

        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(invalid());
        }
        let parsed = url::Url::parse(url).map_err(|_| invalid())?;
        let host = parsed.host_str().ok_or_else(invalid)?;
        if !host.ends_with(".amazonaws.com") {
            return Err(invalid());
        }

        // Virtual-hosted style: bucket.s3.region.amazonaws.com
        if host.contains(".s3.") {
            let bucket = host.split(".s3.").next().filter(|b| !b.is_empty()).ok_or_else(invalid)?;
            let key = parsed.path().trim_start_matches('/');
            return Ok(Self::new(bucket, key));
        }

        // Path style: s3.region.amazonaws.com/bucket/key
        if host.starts_with("s3.") {
            let path = parsed.path().trim_start_matches('/');
            let (bucket, key) = path.split_once('/').unwrap_or((path, ""));
            if bucket.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::new(bucket, key));
        }

        Err(invalid())
    }

    /// Render back to `s3://bucket/key`
    pub fn to_uri(&self) -> String {
        if self.key.is_empty() {
            format!("{}{}", S3_SCHEME, self.bucket)
        } else {
            format!("{}{}/{}", S3_SCHEME, self.bucket, self.key)
        }
    }

    /// Keys ending in `/` are folder markers, not files
    pub fn is_folder(&self) -> bool {
        self.key.ends_with('/')
    }
}

impl fmt::Display for StorageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

impl FromStr for StorageLocator {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Criteria for key enumeration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingFilter {
    pub prefix: String,
    pub suffix: String,
    pub exclude_folders: bool,
}

impl ListingFilter {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn excluding_folders(mut self) -> Self {
        self.exclude_folders = true;
        self
    }

    /// Whether a listed key passes the filter.
    ///
    /// The folder's own marker (`prefix + "/"`, or the prefix itself when it
    /// already ends in `/`) never matches.
    pub fn matches(&self, key: &str) -> bool {
        if !key.starts_with(&self.prefix) || !key.ends_with(&self.suffix) {
            return false;
        }
        if self.is_own_marker(key) {
            return false;
        }
        !(self.exclude_folders && key.ends_with('/'))
    }

    fn is_own_marker(&self, key: &str) -> bool {
        let Some(folder) = key.strip_suffix('/') else {
            return false;
        };
        folder == self.prefix || folder == self.prefix.trim_end_matches('/')
    }
}

/// Storage tier of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageClass {
    #[default]
    Standard,
    ReducedRedundancy,
    StandardIa,
    OnezoneIa,
    IntelligentTiering,
    Glacier,
    GlacierIr,
    DeepArchive,
}

impl StorageClass {
    /// The wire name used by the S3 API
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::ReducedRedundancy => "REDUCED_REDUNDANCY",
            StorageClass::StandardIa => "STANDARD_IA",
            StorageClass::OnezoneIa => "ONEZONE_IA",
            StorageClass::IntelligentTiering => "INTELLIGENT_TIERING",
            StorageClass::Glacier => "GLACIER",
            StorageClass::GlacierIr => "GLACIER_IR",
            StorageClass::DeepArchive => "DEEP_ARCHIVE",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageClass {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STANDARD" => Ok(StorageClass::Standard),
            "REDUCED_REDUNDANCY" => Ok(StorageClass::ReducedRedundancy),
            "STANDARD_IA" => Ok(StorageClass::StandardIa),
            "ONEZONE_IA" => Ok(StorageClass::OnezoneIa),
            "INTELLIGENT_TIERING" | "INTELLIGENT" => Ok(StorageClass::IntelligentTiering),
            "GLACIER" => Ok(StorageClass::Glacier),
            "GLACIER_IR" => Ok(StorageClass::GlacierIr),
            "DEEP_ARCHIVE" => Ok(StorageClass::DeepArchive),
            other => Err(StorageError::format(format!("unknown storage class '{}'", other))),
        }
    }
}

/// Options recognised on uploads.
///
/// `extra` carries backend-specific parameters this crate does not model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub storage_class: StorageClass,
    pub metadata: BTreeMap<String, String>,
    pub acl: Option<String>,
    pub content_type: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl TransferOptions {
    pub fn with_storage_class(storage_class: StorageClass) -> Self {
        Self {
            storage_class,
            ..Default::default()
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }
}

/// Extra signed parameters for a presigned PUT
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresignOptions {
    pub content_type: Option<String>,
    pub acl: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub extra: BTreeMap<String, String>,
}

/// One page of a key listing
#[derive(Debug, Clone, Default)]
pub struct ListObjectsPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

/// Why a single key in a batch delete failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Composite outcome of a batch delete
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    /// Deleted keys; left empty for quiet deletes
    pub deleted: Vec<String>,
    pub errors: Vec<DeleteFailure>,
}

impl DeleteResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: DeleteResult) {
        self.deleted.extend(other.deleted);
        self.errors.extend(other.errors);
    }

    /// Turn per-key failures into `StorageError::PartialBatch`
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.deleted)
        } else {
            Err(StorageError::PartialBatch { failures: self.errors })
        }
    }
}

/// A presigned POST: the form target and the fields to submit with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedPost {
    pub url: String,
    pub fields: BTreeMap<String, String>,
}

/// Where a remote key lands locally, and which directories must exist first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPathPlan {
    pub absolute_path: PathBuf,
    /// Relative to the local root, outermost first
    pub directories_to_create: Vec<PathBuf>,
}
