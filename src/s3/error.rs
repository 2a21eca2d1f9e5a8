//! Error kinds surfaced by the bucket manager and its backends

use std::path::PathBuf;

use crate::s3::types::DeleteFailure;

/// Result alias used across the `s3` module
pub type Result<T> = std::result::Result<T, StorageError>;

/// Everything that can go wrong while talking to object storage.
///
/// Callers branch on the variant, never on the message text.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Malformed input: bad URI, bad key, bad glob pattern
    #[error("invalid input: {0}")]
    Format(String),

    /// A bucket, key or local file that does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote API rejected the request; code and message are kept verbatim
    #[error("backend error {code}: {message}")]
    Backend { code: String, message: String },

    /// A batch delete where some keys failed
    #[error("{} of the batch failed to delete", failures.len())]
    PartialBatch { failures: Vec<DeleteFailure> },

    /// Local filesystem failure
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn format(msg: impl Into<String>) -> Self {
        StorageError::Format(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        StorageError::NotFound(what.into())
    }

    pub fn backend(code: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Backend {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error means "the thing is absent"
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
