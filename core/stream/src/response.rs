//! Streams over backend HTTP responses.

use async_trait::async_trait;
use bytes::Bytes;

use stowage_common::{Error, Result};

use crate::base::ByteStream;

/// Map a transport-level reqwest failure to a gateway error.
pub fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Network(e.to_string())
    }
}

/// Relays a backend response body.
///
/// The body is pulled from the connection only as the consumer reads, and
/// chunks larger than the requested size are held back for the next read.
pub struct ResponseStream {
    response: reqwest::Response,
    pending: Bytes,
    size: Option<u64>,
    content_type: Option<String>,
    name: Option<String>,
}

impl ResponseStream {
    pub fn new(response: reqwest::Response) -> Self {
        let size = response.content_length();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Self {
            response,
            pending: Bytes::new(),
            size,
            content_type,
            name: None,
        }
    }

    /// Override the size, for backends that report it out of band.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn status(&self) -> u16 {
        self.response.status().as_u16()
    }
}

#[async_trait]
impl ByteStream for ResponseStream {
    fn size(&self) -> Option<u64> {
        self.size
    }

    async fn read(&mut self, n: usize) -> Result<Option<Bytes>> {
        let n = n.max(1);
        while self.pending.is_empty() {
            match self.response.chunk().await.map_err(transport_error)? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(None),
            }
        }
        let take = n.min(self.pending.len());
        Ok(Some(self.pending.split_to(take)))
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}
