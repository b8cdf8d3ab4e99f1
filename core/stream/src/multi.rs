//! Concatenation of several streams.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;

use stowage_common::Result;

use crate::base::{BoxStream, ByteStream};

/// Reads each stream in turn until all are drained.
pub struct MultiStream {
    streams: VecDeque<BoxStream>,
    size: Option<u64>,
}

impl MultiStream {
    pub fn new(streams: impl IntoIterator<Item = BoxStream>) -> Self {
        let streams: VecDeque<BoxStream> = streams.into_iter().collect();
        let size = streams
            .iter()
            .map(|s| s.size())
            .try_fold(0u64, |acc, size| size.map(|s| acc + s));
        Self { streams, size }
    }

    /// Append another stream. The total size becomes unknown if its size is.
    pub fn push(&mut self, stream: BoxStream) {
        self.size = match (self.size, stream.size()) {
            (Some(total), Some(size)) => Some(total + size),
            _ => None,
        };
        self.streams.push_back(stream);
    }
}

#[async_trait]
impl ByteStream for MultiStream {
    fn size(&self) -> Option<u64> {
        self.size
    }

    async fn read(&mut self, n: usize) -> Result<Option<Bytes>> {
        while let Some(current) = self.streams.front_mut() {
            if let Some(chunk) = current.read(n).await? {
                return Ok(Some(chunk));
            }
            self.streams.pop_front();
        }
        Ok(None)
    }
}
