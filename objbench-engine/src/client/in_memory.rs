//! In-memory client for tests.
//!
//! This provides an [`ObjectClient`] backed by a `BTreeMap`, removing the need for a running
//! storage service in tests. The client is [`Clone`] so tests can hold a handle for direct
//! inspection while the benchmark owns a pooled copy.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use super::{
    ClientError, ClientResult, GetOptions, ObjectClient, ObjectReader, PutOptions, PutResponse,
};

#[derive(Debug, Default)]
struct Store {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), Bytes>,
    deleted_prefixes: Vec<String>,
    next_version: u64,
}

/// An [`ObjectClient`] keeping all objects in memory.
#[derive(Debug, Clone)]
pub struct InMemoryClient {
    endpoint: String,
    store: Arc<Mutex<Store>>,
    short_writes: bool,
    failing_puts: Option<u64>,
    puts: Arc<AtomicU64>,
    latency: Duration,
}

impl InMemoryClient {
    /// Creates an empty client.
    pub fn new() -> Self {
        Self::with_endpoint("mem://local")
    }

    /// Creates an empty client reporting the given endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            store: Default::default(),
            short_writes: false,
            failing_puts: None,
            puts: Default::default(),
            latency: Duration::ZERO,
        }
    }

    /// Acknowledges one byte less than was uploaded for every non-empty object.
    pub fn with_short_writes(mut self) -> Self {
        self.short_writes = true;
        self
    }

    /// Rejects every `nth` upload, counted across all clones, without storing it.
    pub fn with_failing_puts(mut self, nth: u64) -> Self {
        self.failing_puts = Some(nth.max(1));
        self
    }

    /// Delays every upload and download by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Stores an object directly, bypassing the `ObjectClient` trait.
    pub fn insert(&self, bucket: &str, name: &str, contents: impl Into<Bytes>) {
        let mut store = self.lock();
        store.buckets.insert(bucket.to_owned());
        store
            .objects
            .insert((bucket.to_owned(), name.to_owned()), contents.into());
    }

    /// Returns a clone of the stored contents, if present.
    pub fn get_stored(&self, bucket: &str, name: &str) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&(bucket.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Number of objects stored in `bucket`.
    pub fn object_count(&self, bucket: &str) -> usize {
        self.lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .count()
    }

    /// Returns `true` if the bucket has been created.
    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.lock().buckets.contains(bucket)
    }

    /// All prefixes passed to [`delete_prefix`](ObjectClient::delete_prefix), in call order.
    pub fn deleted_prefixes(&self) -> Vec<String> {
        self.lock().deleted_prefixes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_bucket(&self, bucket: &str) -> ClientResult<()> {
        if self.lock().buckets.contains(bucket) {
            Ok(())
        } else {
            Err(ClientError::generic(
                format!("accessing bucket `{bucket}`"),
                "bucket does not exist",
            ))
        }
    }
}

impl Default for InMemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ObjectClient for InMemoryClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ensure_bucket(&self, bucket: &str) -> ClientResult<()> {
        self.lock().buckets.insert(bucket.to_owned());
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        name: &str,
        mut body: ObjectReader,
        size: u64,
        _options: &PutOptions,
    ) -> ClientResult<PutResponse> {
        self.check_bucket(bucket)?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(nth) = self.failing_puts {
            let count = self.puts.fetch_add(1, Ordering::Relaxed) + 1;
            if count % nth == 0 {
                return Err(ClientError::generic(
                    format!("uploading `{name}`"),
                    "connection reset",
                ));
            }
        }

        let mut contents = Vec::with_capacity(size as usize);
        body.read_to_end(&mut contents).await?;

        let mut acknowledged = contents.len() as u64;
        if self.short_writes && acknowledged > 0 {
            acknowledged -= 1;
        }

        let etag = format!("{:x}", md5::compute(&contents));
        let mut store = self.lock();
        store.next_version += 1;
        let version_id = store.next_version.to_string();
        store
            .objects
            .insert((bucket.to_owned(), name.to_owned()), contents.into());

        Ok(PutResponse {
            key: name.to_owned(),
            etag,
            size: acknowledged,
            version_id: Some(version_id),
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        options: &GetOptions,
    ) -> ClientResult<ObjectReader> {
        self.check_bucket(bucket)?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let contents = self
            .get_stored(bucket, name)
            .ok_or_else(|| ClientError::NotFound(name.to_owned()))?;

        let contents = match options.range {
            Some(range) if !contents.is_empty() => {
                let last = contents.len() as u64 - 1;
                let start = range.start.min(last) as usize;
                let end = range.end.min(last) as usize;
                contents.slice(start..=end)
            }
            _ => contents,
        };

        Ok(Box::pin(std::io::Cursor::new(contents)))
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> ClientResult<u64> {
        let mut store = self.lock();
        store.deleted_prefixes.push(prefix.to_owned());

        let before = store.objects.len();
        store
            .objects
            .retain(|(b, name), _| b != bucket || !name.starts_with(prefix));
        Ok((before - store.objects.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ByteRange;

    async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn put_then_ranged_get() {
        let client = InMemoryClient::new();
        client.ensure_bucket("bench").await.unwrap();

        let body: ObjectReader = Box::pin(std::io::Cursor::new(b"0123456789".to_vec()));
        let response = client
            .put_object("bench", "p/a", body, 10, &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(response.size, 10);
        assert_eq!(response.etag, format!("{:x}", md5::compute(b"0123456789")));

        let options = GetOptions {
            range: Some(ByteRange { start: 2, end: 4 }),
            ..Default::default()
        };
        let reader = client.get_object("bench", "p/a", &options).await.unwrap();
        assert_eq!(read_all(reader).await, b"234");
    }

    #[tokio::test]
    async fn missing_bucket_is_an_error() {
        let client = InMemoryClient::new();
        let body: ObjectReader = Box::pin(std::io::Cursor::new(Vec::new()));
        let result = client
            .put_object("nope", "a", body, 0, &PutOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failing_puts_are_not_stored() {
        let client = InMemoryClient::new().with_failing_puts(2);
        client.ensure_bucket("bench").await.unwrap();

        let mut failures = 0;
        for i in 0..6 {
            let body: ObjectReader = Box::pin(std::io::Cursor::new(b"abc".to_vec()));
            let result = client
                .clone()
                .put_object("bench", &format!("p/{i}"), body, 3, &PutOptions::default())
                .await;
            failures += usize::from(result.is_err());
        }

        assert_eq!(failures, 3);
        assert_eq!(client.object_count("bench"), 3);
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_matching_objects() {
        let client = InMemoryClient::new();
        client.insert("bench", "a/1", "x");
        client.insert("bench", "a/2", "x");
        client.insert("bench", "b/1", "x");
        client.insert("other", "a/3", "x");

        let deleted = client.delete_prefix("bench", "a/").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(client.object_count("bench"), 1);
        assert_eq!(client.object_count("other"), 1);
        assert_eq!(client.deleted_prefixes(), vec!["a/".to_owned()]);
    }
}
