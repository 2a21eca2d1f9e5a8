//! Integration tests for the bucket manager using MinIO via testcontainers
//!
//! These tests require Docker to be running and use the testcontainers crate
//! to spin up a MinIO instance for realistic S3 testing.
//!
//! Run with: cargo test --test s3_integration
//!
//! Note: Tests are conditionally skipped if Docker is not available.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use s3_bucket_manager::s3::{
    BindOptions, BucketManager, KeyLister, ListingFilter, MultipartConfig, PresignOptions, S3Client, S3ClientConfig,
    StorageBackend, StorageClass, StorageError, StorageLocator, TransferOptions,
};
use tempfile::TempDir;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::minio::MinIO;

/// MinIO default credentials
const MINIO_ACCESS_KEY: &str = "minioadmin";
const MINIO_SECRET_KEY: &str = "minioadmin";

/// Test helper to check if Docker is available
fn docker_available() -> bool {
    std::process::Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Start MinIO and return the container with its endpoint URL
async fn start_minio() -> (ContainerAsync<MinIO>, String) {
    let container = MinIO::default()
        .with_env_var("MINIO_ROOT_USER", MINIO_ACCESS_KEY)
        .with_env_var("MINIO_ROOT_PASSWORD", MINIO_SECRET_KEY)
        .start()
        .await
        .expect("Failed to start MinIO container");

    let host = container.get_host().await.expect("Failed to get container host");
    let port = container.get_host_port_ipv4(9000).await.expect("Failed to get MinIO port");

    // Wait for MinIO to be ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    (container, format!("http://{}:{}", host, port))
}

fn minio_config(endpoint: &str) -> S3ClientConfig {
    S3ClientConfig {
        endpoint_url: Some(endpoint.to_string()),
        force_path_style: true,
        region: Some("us-east-1".to_string()),
        access_key_id: Some(MINIO_ACCESS_KEY.to_string()),
        secret_access_key: Some(MINIO_SECRET_KEY.to_string()),
        ..Default::default()
    }
}

/// Helper to create S3 client configured for MinIO
async fn create_minio_client(endpoint: &str) -> Arc<S3Client> {
    Arc::new(
        S3Client::with_config(minio_config(endpoint))
            .await
            .expect("Failed to create MinIO client"),
    )
}

async fn bind(client: &Arc<S3Client>, bucket: &str) -> BucketManager<S3Client> {
    BucketManager::bind(client.clone(), BindOptions::new(bucket).create_if_missing(true))
        .await
        .expect("Failed to bind bucket")
}

/// Binding creates the bucket once; a second bind finds it
#[tokio::test]
async fn test_bind_creates_then_finds_bucket() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let client = create_minio_client(&endpoint).await;

    let err = BucketManager::bind(client.clone(), BindOptions::new("media"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    bind(&client, "media").await;
    let buckets = client.list_buckets().await.expect("Failed to list buckets");
    assert!(buckets.contains(&"media".to_string()));

    // Now present, no create needed
    let manager = BucketManager::bind(client.clone(), BindOptions::new("media"))
        .await
        .expect("Failed to bind existing bucket");
    assert_eq!(manager.bucket(), "media");
}

/// Creating a bucket you already own surfaces the backend code
#[tokio::test]
async fn test_create_existing_bucket_reports_code() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let client = create_minio_client(&endpoint).await;

    client.create_bucket("dup", None).await.expect("Failed to create bucket");
    let err = client.create_bucket("dup", None).await.unwrap_err();

    match err {
        StorageError::Backend { code, .. } => {
            assert!(code == "BucketAlreadyOwnedByYou" || code == "BucketAlreadyExists", "code: {}", code)
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

/// Test object upload and download
#[tokio::test]
async fn test_upload_and_download_object() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let client = create_minio_client(&endpoint).await;
    let manager = bind(&client, "data-bucket").await;

    let test_data = b"Hello, MinIO! This is test data.";
    let options = TransferOptions::default()
        .metadata("origin", "integration")
        .content_type("text/plain");
    manager
        .upload_object("docs/test-file.txt", test_data.to_vec(), &options)
        .await
        .expect("Failed to upload object");

    let dir = TempDir::new().unwrap();
    let path = manager
        .download_object("docs/test-file.txt", dir.path(), false)
        .await
        .expect("Failed to download object");

    assert_eq!(path, dir.path().join("test-file.txt"));
    assert_eq!(std::fs::read(&path).unwrap(), test_data.to_vec());
}

/// Unknown extra parameters are rejected before any request
#[tokio::test]
async fn test_upload_rejects_unknown_extra() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let client = create_minio_client(&endpoint).await;
    let manager = bind(&client, "extras").await;

    let mut options = TransferOptions::with_storage_class(StorageClass::Standard);
    options.extra.insert("NotAParameter".to_string(), "1".to_string());

    let err = manager.upload_object("a.txt", b"a".to_vec(), &options).await.unwrap_err();
    assert!(matches!(err, StorageError::Format(_)));
}

/// Downloading a missing key is NotFound and writes nothing
#[tokio::test]
async fn test_download_missing_key() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let client = create_minio_client(&endpoint).await;
    let manager = bind(&client, "empty-bucket").await;

    let dir = TempDir::new().unwrap();
    let err = manager
        .download_object("nope.txt", dir.path(), false)
        .await
        .unwrap_err();

    assert!(err.is_not_found(), "unexpected error: {:?}", err);
    assert!(!dir.path().join("nope.txt").exists());
}

/// Test listing with pagination
#[tokio::test]
async fn test_listing_pages_through_backend() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let client = create_minio_client(&endpoint).await;
    let manager = bind(&client, "paging").await;

    for i in 1..=5 {
        manager
            .upload_object(&format!("items/k{}", i), b"x".to_vec(), &TransferOptions::default())
            .await
            .expect("Failed to upload");
    }
    manager
        .upload_object("other/k6", b"x".to_vec(), &TransferOptions::default())
        .await
        .expect("Failed to upload");

    let lister = KeyLister::new(client.as_ref(), "paging").with_page_size(2);
    let keys: Vec<String> = lister
        .keys(ListingFilter::prefix("items/"))
        .try_collect()
        .await
        .expect("Failed to list");

    assert_eq!(keys, vec!["items/k1", "items/k2", "items/k3", "items/k4", "items/k5"]);

    let odd = manager
        .list(ListingFilter::prefix("items/"), Some("*[135]"))
        .await
        .expect("Failed to list with pattern");
    assert_eq!(odd, vec!["items/k1", "items/k3", "items/k5"]);
}

/// Upload a directory tree and download it back under a different root
#[tokio::test]
async fn test_directory_round_trip() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let client = create_minio_client(&endpoint).await;
    let manager = bind(&client, "trees").await;

    let source = TempDir::new().unwrap();
    std::fs::create_dir_all(source.path().join("2024/jan")).unwrap();
    std::fs::write(source.path().join("index.html"), b"<html/>").unwrap();
    std::fs::write(source.path().join("2024/jan/clip.mp4"), b"mp4").unwrap();

    let keys = manager
        .upload_directory(source.path(), "site/", &TransferOptions::default())
        .await
        .expect("Failed to upload directory");
    assert_eq!(keys, vec!["site/2024/jan/clip.mp4", "site/index.html"]);

    let target = TempDir::new().unwrap();
    let written = manager
        .download_prefix(target.path(), "site/", ".mp4")
        .await
        .expect("Failed to download prefix");

    assert_eq!(written, vec![target.path().join("2024/jan/clip.mp4")]);
    assert_eq!(std::fs::read(&written[0]).unwrap(), b"mp4");
}

/// Test batch and prefix deletes
#[tokio::test]
async fn test_delete_operations() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let client = create_minio_client(&endpoint).await;
    let manager = bind(&client, "deletes").await;

    for key in ["tmp/a", "tmp/b", "tmp/c", "keep/d", "solo"] {
        manager
            .upload_object(key, b"x".to_vec(), &TransferOptions::default())
            .await
            .expect("Failed to upload");
    }

    manager.delete_object("solo").await.expect("Failed to delete object");

    let result = manager
        .delete_objects(&["tmp/a".to_string()], false)
        .await
        .expect("Failed to delete batch");
    assert_eq!(result.deleted, vec!["tmp/a"]);
    assert!(result.is_success());

    let result = manager.delete_by_prefix("tmp/", true).await.expect("Failed to delete prefix");
    assert!(result.deleted.is_empty());
    assert!(result.is_success());

    let remaining = manager.list(ListingFilter::default(), None).await.unwrap();
    assert_eq!(remaining, vec!["keep/d"]);
}

/// Test server-side copies
#[tokio::test]
async fn test_copy_operations() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let client = create_minio_client(&endpoint).await;
    let source = bind(&client, "source").await;
    let archive = bind(&client, "archive").await;

    source
        .upload_object("reports/q1 final.csv", b"a,b".to_vec(), &TransferOptions::default())
        .await
        .expect("Failed to upload");
    source
        .upload_object("reports/q2.csv", b"c,d".to_vec(), &TransferOptions::default())
        .await
        .expect("Failed to upload");

    source
        .copy_uri("reports/q1 final.csv", "s3://archive/2024/q1.csv")
        .await
        .expect("Failed to copy to URI");
    source
        .copy_object("reports/q2.csv", &StorageLocator::new("archive", ""))
        .await
        .expect("Failed to copy with default key");

    let copied = archive.list(ListingFilter::default(), None).await.unwrap();
    assert_eq!(copied, vec!["2024/q1.csv", "reports/q2.csv"]);

    let mirror = bind(&client, "mirror").await;
    let all = source.copy_all_to_bucket("mirror").await.expect("Failed to copy bucket");
    assert_eq!(all.len(), 2);
    assert_eq!(mirror.list(ListingFilter::default(), None).await.unwrap().len(), 2);
}

/// Large bodies go through multipart upload
#[tokio::test]
async fn test_multipart_upload() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let config = S3ClientConfig {
        multipart: MultipartConfig {
            threshold: 5 * 1024 * 1024,
            chunk_size: 5 * 1024 * 1024,
            max_concurrency: 2,
        },
        ..minio_config(&endpoint)
    };
    let client = Arc::new(S3Client::with_config(config).await.expect("Failed to create client"));
    let manager = bind(&client, "large").await;

    let body: Vec<u8> = (0..11 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    manager
        .upload_object("big.bin", body.clone(), &TransferOptions::default())
        .await
        .expect("Failed to upload multipart");

    let downloaded = client.get_object("large", "big.bin").await.expect("Failed to get object");
    assert_eq!(downloaded.len(), body.len());
    assert_eq!(downloaded, body);
}

/// Large files are streamed from disk in parts and streamed back to disk
#[tokio::test]
async fn test_multipart_file_upload_and_streamed_download() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let config = S3ClientConfig {
        multipart: MultipartConfig {
            threshold: 5 * 1024 * 1024,
            chunk_size: 5 * 1024 * 1024,
            max_concurrency: 2,
        },
        ..minio_config(&endpoint)
    };
    let client = Arc::new(S3Client::with_config(config).await.expect("Failed to create client"));
    let manager = bind(&client, "large-files").await;

    let dir = TempDir::new().unwrap();
    let source = dir.path().join("big.bin");
    let body: Vec<u8> = (0..12 * 1024 * 1024 + 17).map(|i| (i % 241) as u8).collect();
    std::fs::write(&source, &body).unwrap();

    manager
        .upload_file(&source, "files/big.bin", &TransferOptions::default())
        .await
        .expect("Failed to upload file");

    let out = dir.path().join("out");
    let path = manager
        .download_object("files/big.bin", &out, true)
        .await
        .expect("Failed to download");

    assert_eq!(path, out);
    assert_eq!(std::fs::read(&path).unwrap(), body);
}

/// Presigned URLs and POST policies are produced for the bound bucket
#[tokio::test]
async fn test_presigning() {
    if !docker_available() {
        eprintln!("Skipping test: Docker not available");
        return;
    }

    let (_container, endpoint) = start_minio().await;
    let client = create_minio_client(&endpoint).await;
    let manager = bind(&client, "uploads").await;
    let ttl = Duration::from_secs(600);

    let url = manager
        .generate_upload_url_in("incoming", "photo.jpg", ttl, &PresignOptions::default())
        .await
        .expect("Failed to presign upload");
    assert!(url.starts_with(&format!("{}/uploads/incoming/photo.jpg?", endpoint)));
    assert!(url.contains("X-Amz-Signature="));

    let post = manager
        .generate_post_policy("incoming/${filename}", &BTreeMap::new(), &[], ttl)
        .await
        .expect("Failed to presign POST");
    assert_eq!(post.url, format!("{}/uploads/", endpoint));
    assert_eq!(post.fields["key"], "incoming/${filename}");
    assert!(post.fields.contains_key("policy"));
    assert!(post.fields.contains_key("x-amz-signature"));
}

/// The public API works end to end against the in-memory backend, no Docker needed
#[tokio::test]
async fn test_public_api_with_memory_backend() {
    use s3_bucket_manager::s3::MemoryBackend;

    let backend = Arc::new(MemoryBackend::new());
    let manager = BucketManager::bind(
        backend.clone(),
        BindOptions::new("scratch").create_if_missing(true).region("eu-central-1"),
    )
    .await
    .expect("Failed to bind");

    let locator = StorageLocator::parse_url("https://scratch.s3.eu-central-1.amazonaws.com/a/b.txt").unwrap();
    assert_eq!(locator, StorageLocator::new("scratch", "a/b.txt"));

    manager
        .upload_object(&locator.key, b"hi".to_vec(), &TransferOptions::default())
        .await
        .unwrap();
    assert_eq!(backend.object("scratch", "a/b.txt").unwrap().data, b"hi");
    assert_eq!(
        manager.console_url("a/"),
        "https://s3.console.aws.amazon.com/s3/buckets/scratch?region=eu-central-1&prefix=a/&showversions=false"
    );
}
