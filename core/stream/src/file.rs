//! Streams over local readers.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, SeekFrom};

use stowage_common::Result;

use crate::base::ByteStream;
use crate::range::ByteRange;

/// Stream over a local file or any async reader with a size known up front.
pub struct FileStream<R = File> {
    reader: R,
    size: Option<u64>,
    name: Option<String>,
    content_type: Option<String>,
}

impl FileStream<File> {
    /// Open a local file for streaming.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        Ok(Self {
            reader: file,
            size: Some(size),
            name,
            content_type: None,
        })
    }

    /// Open a local file and limit the stream to `range`.
    pub async fn open_range(
        path: impl AsRef<Path>,
        range: &ByteRange,
    ) -> Result<FileStream<tokio::io::Take<File>>> {
        let path = path.as_ref();
        let mut file = File::open(path).await?;
        let total = file.metadata().await?.len();
        let (start, end) = range.resolve(total)?;
        file.seek(SeekFrom::Start(start)).await?;
        let length = end + 1 - start;

        Ok(FileStream {
            reader: file.take(length),
            size: Some(length),
            name: path.file_name().and_then(|n| n.to_str()).map(String::from),
            content_type: None,
        })
    }
}

impl<R: AsyncRead + Unpin + Send> FileStream<R> {
    /// Wrap an arbitrary reader.
    pub fn from_reader(reader: R, size: Option<u64>) -> Self {
        Self {
            reader,
            size,
            name: None,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteStream for FileStream<R> {
    fn size(&self) -> Option<u64> {
        self.size
    }

    async fn read(&mut self, n: usize) -> Result<Option<Bytes>> {
        let mut buffer = vec![0u8; n.max(1)];
        let read = self.reader.read(&mut buffer).await?;
        if read == 0 {
            return Ok(None);
        }
        buffer.truncate(read);
        Ok(Some(Bytes::from(buffer)))
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::read_to_end;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_stream_reads_whole_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let mut stream = FileStream::open(&path).await.unwrap();
        assert_eq!(stream.size(), Some(10));
        assert_eq!(stream.name(), Some("data.bin"));
        let data = read_to_end(&mut stream, 4).await.unwrap();
        assert_eq!(&data[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_file_stream_range() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let range = ByteRange::new(2, Some(5));
        let mut stream = FileStream::open_range(&path, &range).await.unwrap();
        assert_eq!(stream.size(), Some(4));
        let data = read_to_end(&mut stream, 64).await.unwrap();
        assert_eq!(&data[..], b"2345");
    }
}
