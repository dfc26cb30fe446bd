//! Reader adapters used while timing transfers.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::{fmt, io, task};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Records the moment the first byte is read from the wrapped reader.
#[derive(Debug)]
pub struct FirstByteRecorder<R> {
    inner: R,
    first_byte: Option<DateTime<Utc>>,
}

impl<R> FirstByteRecorder<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            first_byte: None,
        }
    }

    /// When the first byte arrived, if any has been read yet.
    pub fn first_byte(&self) -> Option<DateTime<Utc>> {
        self.first_byte
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FirstByteRecorder<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);

        if self.first_byte.is_none()
            && matches!(poll, task::Poll::Ready(Ok(())))
            && buf.filled().len() > before
        {
            self.first_byte = Some(Utc::now());
        }

        poll
    }
}

/// Handle to the digest computed by a [`HashingReader`].
#[derive(Clone)]
pub struct Checksum(Arc<Mutex<md5::Context>>);

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Checksum").field(&self.hex()).finish()
    }
}

impl Checksum {
    /// Hex MD5 of all bytes read so far.
    pub fn hex(&self) -> String {
        let context = self.0.lock().unwrap_or_else(PoisonError::into_inner).clone();
        format!("{:x}", context.compute())
    }
}

/// Computes the MD5 digest of everything read through it.
///
/// The digest stays available through the [`Checksum`] handle after the reader has been moved
/// into a client call.
pub struct HashingReader<R> {
    inner: R,
    context: Arc<Mutex<md5::Context>>,
}

impl<R: fmt::Debug> fmt::Debug for HashingReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashingReader")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<R> HashingReader<R> {
    /// Wraps `inner` and returns the handle to its digest.
    pub fn new(inner: R) -> (Self, Checksum) {
        let context = Arc::new(Mutex::new(md5::Context::new()));
        let checksum = Checksum(Arc::clone(&context));
        (Self { inner, context }, checksum)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);

        if let task::Poll::Ready(Ok(())) = poll {
            let read = &buf.filled()[before..];
            if !read.is_empty() {
                self.context
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .consume(read);
            }
        }

        poll
    }
}

/// Reads `reader` to the end, feeding every byte into `context`, and returns the byte count.
pub async fn drain_into<R>(reader: &mut R, context: &mut md5::Context) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0; 64 * 1024];
    let mut total = 0;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        context.consume(&buf[..n]);
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn first_byte_is_stamped_once() {
        let mut reader = FirstByteRecorder::new(Cursor::new(vec![1u8; 100]));
        assert!(reader.first_byte().is_none());

        let mut buf = [0u8; 10];
        reader.read_exact(&mut buf).await.unwrap();
        let first = reader.first_byte().unwrap();

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(reader.first_byte(), Some(first));
    }

    #[tokio::test]
    async fn empty_reader_has_no_first_byte() {
        let mut reader = FirstByteRecorder::new(Cursor::new(Vec::<u8>::new()));
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(reader.first_byte().is_none());
    }

    #[tokio::test]
    async fn hashing_reader_matches_md5() {
        let (mut reader, checksum) = HashingReader::new(Cursor::new(b"hello world".to_vec()));
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();

        assert_eq!(checksum.hex(), format!("{:x}", md5::compute(b"hello world")));
    }

    #[test]
    fn debug_shows_the_digest() {
        let (reader, checksum) = HashingReader::new(Cursor::new(Vec::<u8>::new()));
        let empty = format!("{:x}", md5::compute(b""));

        assert_eq!(format!("{checksum:?}"), format!("Checksum({empty:?})"));
        assert!(format!("{reader:?}").starts_with("HashingReader { inner: Cursor"));
    }

    #[tokio::test]
    async fn drain_counts_and_hashes() {
        let data = vec![7u8; 200_000];
        let mut context = md5::Context::new();
        let n = drain_into(&mut Cursor::new(data.clone()), &mut context)
            .await
            .unwrap();

        assert_eq!(n, 200_000);
        assert_eq!(context.compute(), md5::compute(&data));
    }
}
