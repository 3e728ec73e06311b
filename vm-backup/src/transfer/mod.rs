//! Byte-stream plumbing shared by writers and handlers.

pub mod progress;
pub mod progress_stream;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Readable byte stream flowing between the exporter and a remote
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Live byte counter shared with the exporter.
///
/// Updated while bytes flow so callers can observe the transfer size before
/// the stream ends.
#[derive(Debug, Clone, Default)]
pub struct SizeContainer {
    size: Arc<AtomicU64>,
}

impl SizeContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn add(&self, bytes: u64) {
        self.size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set(&self, bytes: u64) {
        self.size.store(bytes, Ordering::Relaxed);
    }
}

/// Build a [`ByteStream`] from in-memory chunks
pub fn stream_from_chunks(chunks: Vec<Vec<u8>>) -> ByteStream {
    Box::pin(futures_util::stream::iter(
        chunks.into_iter().map(|c| Ok(Bytes::from(c))),
    ))
}

/// Build a [`ByteStream`] that reads a file chunk by chunk
pub fn stream_from_reader<R>(reader: R) -> ByteStream
where
    R: tokio::io::AsyncRead + Send + 'static,
{
    Box::pin(tokio_util::io::ReaderStream::new(reader))
}
