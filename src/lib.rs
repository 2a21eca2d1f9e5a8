//! S3 Bucket Manager Library
//!
//! A bucket-bound facade over object storage: URI parsing, lazy key
//! listing, directory transfers, batch deletes and presigned uploads.
//! The binary in `main.rs` is a thin command line over these modules.

pub mod s3;
pub mod settings;
