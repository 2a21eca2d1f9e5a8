//! Lazy, paginated key enumeration

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use tracing::debug;

use crate::s3::backend::{StorageBackend, MAX_KEYS_PER_PAGE};
use crate::s3::error::{Result, StorageError};
use crate::s3::pattern::GlobPattern;
use crate::s3::types::ListingFilter;

enum Cursor {
    Start,
    Token(String),
    Done,
}

/// Walks the keys of one bucket, one page at a time
pub struct KeyLister<'a, B: StorageBackend + ?Sized> {
    backend: &'a B,
    bucket: &'a str,
    page_size: i32,
}

impl<'a, B: StorageBackend + ?Sized> KeyLister<'a, B> {
    pub fn new(backend: &'a B, bucket: &'a str) -> Self {
        Self {
            backend,
            bucket,
            page_size: MAX_KEYS_PER_PAGE,
        }
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = page_size.clamp(1, MAX_KEYS_PER_PAGE);
        self
    }

    /// Stream the keys passing `filter`.
    ///
    /// Nothing is requested until the stream is polled, and the next page is
    /// only fetched once the current one is drained. Every call starts a
    /// fresh enumeration. A backend error ends the stream.
    pub fn keys(&self, filter: ListingFilter) -> impl Stream<Item = Result<String>> + Send + 'a {
        let backend = self.backend;
        let bucket = self.bucket;
        let page_size = self.page_size;

        let pages = stream::try_unfold(Cursor::Start, move |cursor| {
            let filter = filter.clone();
            async move {
                let token = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::Start => None,
                    Cursor::Token(token) => Some(token),
                };

                let page = backend
                    .list_objects(bucket, &filter.prefix, token.as_deref(), page_size)
                    .await?;

                debug!(
                    bucket = %bucket,
                    prefix = %filter.prefix,
                    keys = page.keys.len(),
                    more = page.next_token.is_some(),
                    "Fetched listing page"
                );

                let next = match page.next_token {
                    Some(token) => Cursor::Token(token),
                    None => Cursor::Done,
                };
                let keys: Vec<String> = page.keys.into_iter().filter(|k| filter.matches(k)).collect();

                Ok::<_, StorageError>(Some((keys, next)))
            }
        });

        pages
            .map_ok(|keys| stream::iter(keys.into_iter().map(Ok::<String, StorageError>)))
            .try_flatten()
            .boxed()
    }

    /// Materialise the listing, then apply an optional wildcard pattern
    pub async fn collect(&self, filter: ListingFilter, pattern: Option<&str>) -> Result<Vec<String>> {
        // Compile first so a bad pattern fails before any request
        let pattern = pattern.filter(|p| !p.is_empty()).map(GlobPattern::new).transpose()?;

        let keys: Vec<String> = self.keys(filter).try_collect().await?;

        Ok(match pattern {
            Some(pattern) => pattern.filter(keys),
            None => keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::memory::MemoryBackend;

    fn backend_with(keys: &[&str], page_size: usize) -> MemoryBackend {
        let backend = MemoryBackend::with_page_size(page_size);
        for key in keys {
            backend.insert("bucket", key, b"x".to_vec());
        }
        backend
    }

    #[tokio::test]
    async fn test_three_pages_yield_all_keys_in_order() {
        let backend = backend_with(&["k1", "k2", "k3", "k4", "k5"], 2);
        let lister = KeyLister::new(&backend, "bucket");

        let keys = lister.collect(ListingFilter::default(), None).await.unwrap();

        assert_eq!(keys, vec!["k1", "k2", "k3", "k4", "k5"]);
        assert_eq!(backend.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_prefix_listing_skips_folder_marker() {
        let backend = backend_with(&["logs/a.txt", "logs/b.txt", "other/c.txt", "logs/"], 1000);
        let lister = KeyLister::new(&backend, "bucket");

        let keys = lister.collect(ListingFilter::prefix("logs/"), None).await.unwrap();

        assert_eq!(keys, vec!["logs/a.txt", "logs/b.txt"]);
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let backend = backend_with(&["a", "b", "c", "d"], 2);
        let lister = KeyLister::new(&backend, "bucket");

        let stream = lister.keys(ListingFilter::default());
        assert_eq!(backend.list_calls(), 0);

        let first_two: Vec<Result<String>> = stream.take(2).collect().await;
        assert_eq!(first_two.len(), 2);
        assert_eq!(backend.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_each_call_restarts_enumeration() {
        let backend = backend_with(&["a", "b", "c"], 2);
        let lister = KeyLister::new(&backend, "bucket");

        let first = lister.collect(ListingFilter::default(), None).await.unwrap();
        let second = lister.collect(ListingFilter::default(), None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.list_calls(), 4);
    }

    #[tokio::test]
    async fn test_empty_prefix_match_is_empty_not_error() {
        let backend = backend_with(&["a/1", "a/2"], 1000);
        let lister = KeyLister::new(&backend, "bucket");

        let keys = lister.collect(ListingFilter::prefix("missing/"), None).await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_suffix_exclude_folders_and_pattern() {
        let backend = backend_with(
            &["img/", "img/a.jpg", "img/b.png", "img/sub/", "img/sub/c.jpg", "img/d-1.jpg"],
            2,
        );
        let lister = KeyLister::new(&backend, "bucket");

        let folders_dropped = lister
            .collect(ListingFilter::prefix("img/").excluding_folders(), None)
            .await
            .unwrap();
        assert_eq!(folders_dropped, vec!["img/a.jpg", "img/b.png", "img/d-1.jpg", "img/sub/c.jpg"]);

        let jpgs = lister
            .collect(ListingFilter::prefix("img/").with_suffix(".jpg"), None)
            .await
            .unwrap();
        assert_eq!(jpgs, vec!["img/a.jpg", "img/d-1.jpg", "img/sub/c.jpg"]);

        let patterned = lister
            .collect(ListingFilter::prefix("img/"), Some("img/?-[0-9].jpg"))
            .await
            .unwrap();
        assert_eq!(patterned, vec!["img/d-1.jpg"]);
    }

    #[tokio::test]
    async fn test_bad_pattern_fails_before_listing() {
        let backend = backend_with(&["a"], 1000);
        let lister = KeyLister::new(&backend, "bucket");

        let err = lister.collect(ListingFilter::default(), Some("[abc")).await.unwrap_err();
        assert!(matches!(err, StorageError::Format(_)));
        assert_eq!(backend.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_bucket_propagates() {
        let backend = MemoryBackend::new();
        let lister = KeyLister::new(&backend, "nope");

        let err = lister.collect(ListingFilter::default(), None).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
