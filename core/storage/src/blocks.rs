//! Chunked (block) uploads.
//!
//! Large payloads are cut into fixed-size blocks in stream order. Each block
//! is addressed by an id derived from the upload session prefix and the
//! block index, so re-sending a block overwrites it instead of adding a
//! duplicate, and the final commit lists ids rather than relying on arrival
//! order.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use stowage_common::{Result, UploadConfig};
use stowage_stream::{ByteStream, CutoffStream};

/// Destination of individual blocks.
#[async_trait]
pub trait BlockSink: Send + Sync {
    /// Store one block under `block_id`, consuming `block` to the end.
    async fn put_block(&self, block_id: &str, block: &mut dyn ByteStream) -> Result<()>;
}

/// Block layout of one upload session.
#[derive(Debug, Clone)]
pub struct BlockUploadPlan {
    prefix: String,
    block_size: u64,
}

impl BlockUploadPlan {
    /// A fresh session with a random prefix.
    pub fn new(block_size: u64) -> Self {
        Self::with_prefix(Uuid::new_v4().simple().to_string(), block_size)
    }

    /// A session with a known prefix, used to resume or retry a session.
    pub fn with_prefix(prefix: impl Into<String>, block_size: u64) -> Self {
        Self {
            prefix: prefix.into(),
            block_size: block_size.max(1),
        }
    }

    /// Whether a payload of `size` bytes must go up in blocks.
    ///
    /// Payloads of unknown size are chunked, since they may be arbitrarily
    /// large.
    pub fn should_chunk(size: Option<u64>, config: &UploadConfig) -> bool {
        size.is_none_or(|size| size > config.block_threshold)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Deterministic id of block `index`.
    ///
    /// Ids are base64 of a fixed-width string, so every id in a session has
    /// the same length (some backends require that).
    pub fn block_id(&self, index: u64) -> String {
        STANDARD.encode(format!("{}-{:06}", self.prefix, index))
    }

    /// Number of blocks for a payload of known size.
    pub fn block_count(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size)
    }

    /// Cut `stream` into blocks and hand them to `sink` in order.
    ///
    /// Returns the block ids in stream order, ready for a commit call.
    pub async fn upload_blocks(
        &self,
        stream: &mut dyn ByteStream,
        sink: &dyn BlockSink,
        chunk_size: usize,
    ) -> Result<Vec<String>> {
        let mut offset = 0u64;
        let mut ids = Vec::new();
        loop {
            let first_read = chunk_size.min(self.block_size as usize).max(1);
            let Some(head) = stream.read(first_read).await? else {
                break;
            };

            let id = self.block_id(ids.len() as u64);
            let head_len = head.len() as u64;
            let rest = CutoffStream::at(&mut *stream, offset + head_len, self.block_size - head_len);
            let mut block = Block {
                size: rest.size().map(|rest| rest + head_len),
                head: Some(head),
                rest,
            };
            debug!("Uploading block {} ({})", ids.len(), id);
            sink.put_block(&id, &mut block).await?;
            offset += self.block_size - block.rest.remaining();
            ids.push(id);
        }
        Ok(ids)
    }
}

/// One block: the chunk already read to detect end of stream, then the
/// rest of the block.
struct Block<'a> {
    head: Option<Bytes>,
    rest: CutoffStream<'a>,
    size: Option<u64>,
}

#[async_trait]
impl ByteStream for Block<'_> {
    fn size(&self) -> Option<u64> {
        self.size
    }

    async fn read(&mut self, n: usize) -> Result<Option<Bytes>> {
        match self.head.take() {
            Some(head) => Ok(Some(head)),
            None => self.rest.read(n).await,
        }
    }
}
