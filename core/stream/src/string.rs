//! In-memory streams.

use async_trait::async_trait;
use bytes::Bytes;

use stowage_common::Result;

use crate::base::ByteStream;

/// Stream over an in-memory buffer.
///
/// Used when a backend cannot stream or report a size up front, e.g.
/// documents exported on demand.
pub struct StringStream {
    data: Bytes,
    size: u64,
    content_type: Option<String>,
}

impl StringStream {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            data,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[async_trait]
impl ByteStream for StringStream {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    async fn read(&mut self, n: usize) -> Result<Option<Bytes>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let take = n.max(1).min(self.data.len());
        Ok(Some(self.data.split_to(take)))
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}

/// Zero-length stream.
#[derive(Debug, Default)]
pub struct EmptyStream;

#[async_trait]
impl ByteStream for EmptyStream {
    fn size(&self) -> Option<u64> {
        Some(0)
    }

    async fn read(&mut self, _n: usize) -> Result<Option<Bytes>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_stream_chunks() {
        let mut stream = StringStream::new(vec![1u8, 2, 3, 4, 5]);
        assert_eq!(stream.size(), Some(5));
        assert_eq!(stream.read(2).await.unwrap().unwrap().as_ref(), &[1, 2]);
        assert_eq!(stream.read(10).await.unwrap().unwrap().as_ref(), &[3, 4, 5]);
        assert!(stream.read(10).await.unwrap().is_none());
        // Size reports the original length, not what is left.
        assert_eq!(stream.size(), Some(5));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut stream = EmptyStream;
        assert_eq!(stream.size(), Some(0));
        assert!(stream.read(1).await.unwrap().is_none());
    }
}
