//! The byte stream contract.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::Stream;

use stowage_common::Result;

/// A single-pass, finite byte sequence.
///
/// Streams are owned by whichever task is relaying them and must never be
/// read by two operations at once. Once drained they cannot be replayed.
#[async_trait]
pub trait ByteStream: Send {
    /// Total size in bytes, when known up front.
    fn size(&self) -> Option<u64>;

    /// Read at most `n` bytes.
    ///
    /// Returns `Ok(None)` at end of stream and never yields an empty chunk.
    async fn read(&mut self, n: usize) -> Result<Option<Bytes>>;

    /// MIME type of the payload, if the source declared one.
    fn content_type(&self) -> Option<&str> {
        None
    }

    /// File name hint, if the source declared one.
    fn name(&self) -> Option<&str> {
        None
    }
}

/// Owned, type-erased stream handed between providers.
pub type BoxStream = Box<dyn ByteStream>;

#[async_trait]
impl ByteStream for BoxStream {
    fn size(&self) -> Option<u64> {
        (**self).size()
    }

    async fn read(&mut self, n: usize) -> Result<Option<Bytes>> {
        (**self).read(n).await
    }

    fn content_type(&self) -> Option<&str> {
        (**self).content_type()
    }

    fn name(&self) -> Option<&str> {
        (**self).name()
    }
}

/// Drain a stream into memory.
///
/// Only for payloads known to be small (tests, export-on-demand documents).
pub async fn read_to_end(stream: &mut dyn ByteStream, chunk_size: usize) -> Result<Bytes> {
    let mut buffer = BytesMut::with_capacity(stream.size().unwrap_or(0) as usize);
    while let Some(chunk) = stream.read(chunk_size).await? {
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Adapt a stream into a [`futures::Stream`] of chunks.
///
/// Each poll pulls exactly one chunk from the source, so an HTTP client
/// sending this as a request body reads no faster than the socket drains.
pub fn into_stream(
    stream: BoxStream,
    chunk_size: usize,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    futures::stream::try_unfold(stream, move |mut stream| async move {
        Ok(stream.read(chunk_size).await?.map(|chunk| (chunk, stream)))
    })
}
