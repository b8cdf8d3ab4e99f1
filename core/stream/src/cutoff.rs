//! Bounded view over another stream.

use async_trait::async_trait;
use bytes::Bytes;

use stowage_common::Result;

use crate::base::ByteStream;

/// Yields at most `cutoff` bytes of the wrapped stream.
///
/// Borrows the inner stream, so consecutive cutoffs over the same source
/// produce consecutive, non-overlapping slices. Block uploads are built on
/// this.
pub struct CutoffStream<'a> {
    inner: &'a mut dyn ByteStream,
    offset: u64,
    cutoff: u64,
    remaining: u64,
}

impl<'a> CutoffStream<'a> {
    /// Cut from the start of an unread stream.
    pub fn new(inner: &'a mut dyn ByteStream, cutoff: u64) -> Self {
        Self::at(inner, 0, cutoff)
    }

    /// Cut from a stream that has already handed out `offset` bytes.
    ///
    /// The offset only feeds [`ByteStream::size`]; reads continue wherever
    /// the inner stream is.
    pub fn at(inner: &'a mut dyn ByteStream, offset: u64, cutoff: u64) -> Self {
        Self {
            inner,
            offset,
            cutoff,
            remaining: cutoff,
        }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

#[async_trait]
impl ByteStream for CutoffStream<'_> {
    fn size(&self) -> Option<u64> {
        self.inner
            .size()
            .map(|total| total.saturating_sub(self.offset).min(self.cutoff))
    }

    async fn read(&mut self, n: usize) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = (n.max(1) as u64).min(self.remaining) as usize;
        match self.inner.read(want).await? {
            Some(chunk) => {
                self.remaining -= chunk.len() as u64;
                Ok(Some(chunk))
            }
            None => {
                self.remaining = 0;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::read_to_end;
    use crate::string::StringStream;

    #[tokio::test]
    async fn test_consecutive_cutoffs_partition_source() {
        let mut source = StringStream::new("abcdefghij");

        let first = read_to_end(&mut CutoffStream::new(&mut source, 4), 3)
            .await
            .unwrap();
        let second = read_to_end(&mut CutoffStream::new(&mut source, 4), 3)
            .await
            .unwrap();
        let third = read_to_end(&mut CutoffStream::new(&mut source, 4), 3)
            .await
            .unwrap();

        assert_eq!(&first[..], b"abcd");
        assert_eq!(&second[..], b"efgh");
        assert_eq!(&third[..], b"ij");
    }

    #[tokio::test]
    async fn test_size_counts_bytes_left() {
        let mut source = StringStream::new("abcdefghij");
        let mut offset = 0;
        let mut sizes = Vec::new();
        for _ in 0..3 {
            let mut cutoff = CutoffStream::at(&mut source, offset, 4);
            let declared = cutoff.size();
            let data = read_to_end(&mut cutoff, 3).await.unwrap();
            assert_eq!(declared, Some(data.len() as u64));
            offset += data.len() as u64;
            sizes.push(declared);
        }
        assert_eq!(sizes, vec![Some(4), Some(4), Some(2)]);
    }

    #[tokio::test]
    async fn test_unknown_inner_size() {
        let mut source = crate::file::FileStream::from_reader(&b"abc"[..], None);
        let cutoff = CutoffStream::new(&mut source, 2);
        assert_eq!(cutoff.size(), None);
    }

    #[tokio::test]
    async fn test_cutoff_past_end() {
        let mut source = StringStream::new("abc");
        let mut cutoff = CutoffStream::new(&mut source, 10);
        assert_eq!(cutoff.size(), Some(3));
        assert_eq!(cutoff.read(100).await.unwrap().unwrap().as_ref(), b"abc");
        assert!(cutoff.read(100).await.unwrap().is_none());
    }
}
