//! The storage client seam and the pool that hands clients to workers.
//!
//! Benchmarks never talk to a storage service directly. They acquire a [`ClientGuard`] from a
//! [`ClientPool`] before each call and drop it afterwards, which lets the pool spread load over
//! several endpoints.

use std::fmt::{self, Debug};
use std::io;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncRead;

mod in_memory;

pub use in_memory::InMemoryClient;

use crate::error::{Error, Result};

/// A readable object body, used for uploads and downloads alike.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// A type-erased [`ObjectClient`] instance.
pub type BoxedClient = Arc<dyn ObjectClient>;

/// Options applied to every upload.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Content type sent along with the object.
    pub content_type: Option<String>,
}

/// An inclusive byte range, as used in HTTP `Range` headers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ByteRange {
    /// Offset of the first byte.
    pub start: u64,
    /// Offset of the last byte.
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Options for a single download.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// Restricts the download to a part of the object.
    pub range: Option<ByteRange>,
    /// Requests a specific version of the object.
    pub version_id: Option<String>,
}

/// The storage's acknowledgement of an upload.
#[derive(Clone, Debug, Default)]
pub struct PutResponse {
    /// Key under which the object was stored.
    pub key: String,
    /// Entity tag reported by the storage, empty if unknown.
    pub etag: String,
    /// Number of bytes the storage accepted.
    pub size: u64,
    /// Version assigned by the storage, if versioning is enabled.
    pub version_id: Option<String>,
}

/// Errors reported by an [`ObjectClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O errors while streaming payloads.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The call did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The requested object does not exist.
    #[error("object `{0}` not found")]
    NotFound(String),

    /// Any other error from the storage service or the transport.
    #[error("storage error: {context}")]
    Generic {
        /// What the client was doing when the error occurred.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ClientError {
    /// Wraps an arbitrary error with a description of the failed action.
    pub fn generic<E>(context: impl Into<String>, cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Generic {
            context: context.into(),
            cause: cause.into(),
        }
    }
}

/// Result type for client calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// A connection to an S3-style storage service.
#[async_trait::async_trait]
pub trait ObjectClient: Debug + Send + Sync + 'static {
    /// Identifier of the endpoint this client talks to.
    fn endpoint(&self) -> &str;

    /// Creates the bucket unless it already exists.
    async fn ensure_bucket(&self, bucket: &str) -> ClientResult<()>;

    /// Uploads `size` bytes read from `body` as `name`.
    async fn put_object(
        &self,
        bucket: &str,
        name: &str,
        body: ObjectReader,
        size: u64,
        options: &PutOptions,
    ) -> ClientResult<PutResponse>;

    /// Opens a download of `name`.
    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        options: &GetOptions,
    ) -> ClientResult<ObjectReader>;

    /// Deletes all objects whose name starts with `prefix` and returns how many were removed.
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> ClientResult<u64>;
}

/// A set of clients shared by all workers of a benchmark.
///
/// Every [`acquire`](Self::acquire) picks the client with the fewest calls in flight.
#[derive(Clone)]
pub struct ClientPool {
    clients: Arc<[BoxedClient]>,
    in_flight: Arc<[AtomicUsize]>,
}

impl ClientPool {
    /// Creates a pool over the given clients.
    pub fn new(clients: Vec<BoxedClient>) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::Config("at least one client is required".into()));
        }

        let in_flight = clients.iter().map(|_| AtomicUsize::new(0)).collect();
        Ok(Self {
            clients: clients.into(),
            in_flight,
        })
    }

    /// Creates a pool with a single client.
    pub fn single(client: impl ObjectClient) -> Self {
        Self {
            clients: Arc::from([Arc::new(client) as BoxedClient]),
            in_flight: Arc::from([AtomicUsize::new(0)]),
        }
    }

    /// Takes the least busy client until the returned guard is dropped.
    pub fn acquire(&self) -> ClientGuard {
        let slot = self
            .in_flight
            .iter()
            .enumerate()
            .min_by_key(|(_, count)| count.load(Ordering::Relaxed))
            .map(|(slot, _)| slot)
            .unwrap_or_default();

        self.in_flight[slot].fetch_add(1, Ordering::Relaxed);
        ClientGuard {
            client: Arc::clone(&self.clients[slot]),
            in_flight: Arc::clone(&self.in_flight),
            slot,
        }
    }
}

impl fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.clients.iter().map(|c| c.endpoint()))
            .finish()
    }
}

/// RAII guard for a client taken from a [`ClientPool`].
///
/// Dropping the guard returns the client to the pool.
pub struct ClientGuard {
    client: BoxedClient,
    in_flight: Arc<[AtomicUsize]>,
    slot: usize,
}

impl Deref for ClientGuard {
    type Target = dyn ObjectClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.in_flight[self.slot].fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for ClientGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientGuard")
            .field("endpoint", &self.client.endpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_spreads_over_clients() {
        let pool = ClientPool::new(vec![
            Arc::new(InMemoryClient::with_endpoint("mem://a")),
            Arc::new(InMemoryClient::with_endpoint("mem://b")),
        ])
        .unwrap();

        let first = pool.acquire();
        let second = pool.acquire();
        assert_ne!(first.endpoint(), second.endpoint());

        drop(first);
        let third = pool.acquire();
        assert_eq!(third.endpoint(), "mem://a");
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(ClientPool::new(vec![]), Err(Error::Config(_))));
    }

    #[test]
    fn byte_range_is_inclusive() {
        let range = ByteRange { start: 10, end: 19 };
        assert_eq!(range.len(), 10);
    }
}
