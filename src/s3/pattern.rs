//! Shell-style wildcard matching for listed keys
//!
//! Supports `*`, `?`, `[abc]`, `[a-z]` and `[!abc]`. As with `fnmatch`,
//! `*` also crosses `/`.

use glob::Pattern;

use crate::s3::error::{Result, StorageError};

/// A compiled wildcard pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    pattern: Pattern,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Pattern::new(pattern)
            .map_err(|e| StorageError::format(format!("invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self { pattern })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn is_match(&self, key: &str) -> bool {
        // Default options: separators are not special
        self.pattern.matches(key)
    }

    /// Keep only the keys matching the pattern, preserving order
    pub fn filter(&self, keys: Vec<String>) -> Vec<String> {
        keys.into_iter().filter(|k| self.is_match(k)).collect()
    }
}
