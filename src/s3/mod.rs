//! Object storage module
//!
//! This module provides the bucket-facing functionality:
//! - [`manager::BucketManager`] - Operations bound to one bucket
//! - [`client::S3Client`] - AWS S3 backend
//! - [`memory::MemoryBackend`] - In-process backend for tests and dry runs
//! - [`lister::KeyLister`] - Lazy paginated key listing
//! - [`paths`] - Remote key to local path mapping
//! - [`types`] - Locators, filters, transfer options and results

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod lister;
pub mod manager;
pub mod memory;
pub mod paths;
pub mod pattern;
pub mod post_policy;
pub mod types;

// Re-export commonly used types
pub use backend::StorageBackend;
pub use client::S3Client;
pub use config::{MultipartConfig, S3ClientConfig};
pub use error::{Result, StorageError};
pub use lister::KeyLister;
pub use manager::{BindOptions, BucketManager};
pub use memory::MemoryBackend;
pub use pattern::GlobPattern;
pub use types::{
    DeleteFailure, DeleteResult, ListingFilter, LocalPathPlan, PresignOptions, PresignedPost, StorageClass,
    StorageLocator, TransferOptions,
};
