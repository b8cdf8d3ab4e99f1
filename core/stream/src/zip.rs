//! Streaming ZIP archive encoder.
//!
//! The archive is produced in a single pass: each entry gets a local header
//! with zeroed sizes and the general purpose bit 3 set, its body, then a
//! data descriptor carrying the real CRC-32 and sizes. The central directory
//! is written once every entry has been drained.
//!
//! Entries whose size is unknown up front, or at least 4 GiB, are written
//! with ZIP64 extra fields and 8-byte descriptor sizes. A ZIP64 end of
//! central directory record is added whenever an offset, size or count in
//! the directory overflows the classic fields.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, Timelike, Utc};
use flate2::{Compress, Compression, FlushCompress, Status};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;

use stowage_common::{Error, Result};

use crate::base::{BoxStream, ByteStream};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;

const ZIP64_EXTRA_ID: u16 = 0x0001;
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
const FLAG_UTF8: u16 = 0x0800;

const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
// Upper byte 3 = Unix, so external attributes carry mode bits.
const VERSION_MADE_BY: u16 = (3 << 8) | VERSION_ZIP64;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

const U32_MAX: u64 = 0xFFFF_FFFF;
const U16_MAX: u64 = 0xFFFF;

/// Opens an entry's stream on demand, so only one backend download is in
/// flight while the archive is produced.
pub type StreamOpener = Box<dyn FnOnce() -> BoxFuture<'static, Result<BoxStream>> + Send>;

/// Per-entry compression method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ZipCompression {
    Stored,
    #[default]
    Deflated,
}

enum EntrySource {
    Ready(BoxStream),
    Deferred(StreamOpener),
    Directory,
}

/// One archive member.
pub struct ZipEntry {
    name: String,
    modified: DateTime<Utc>,
    compression: ZipCompression,
    source: EntrySource,
}

impl ZipEntry {
    /// A file entry over an already opened stream.
    pub fn file(name: impl Into<String>, stream: BoxStream) -> Self {
        Self::with_source(name.into(), EntrySource::Ready(stream))
    }

    /// A file entry whose stream is opened when the encoder reaches it.
    pub fn deferred<F, Fut>(name: impl Into<String>, open: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<BoxStream>> + Send + 'static,
    {
        let opener: StreamOpener = Box::new(move || Box::pin(open()));
        Self::with_source(name.into(), EntrySource::Deferred(opener))
    }

    /// An empty directory entry. A trailing `/` is added if missing.
    pub fn directory(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        let mut entry = Self::with_source(name, EntrySource::Directory);
        entry.compression = ZipCompression::Stored;
        entry
    }

    fn with_source(name: String, source: EntrySource) -> Self {
        Self {
            name,
            modified: Utc::now(),
            compression: ZipCompression::default(),
            source,
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_compression(mut self, compression: ZipCompression) -> Self {
        if !matches!(self.source, EntrySource::Directory) {
            self.compression = compression;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.source, EntrySource::Directory)
    }
}

/// What the central directory needs to know about a written entry.
struct Record {
    name: Vec<u8>,
    time: u16,
    date: u16,
    method: u16,
    flags: u16,
    crc: u32,
    compressed: u64,
    uncompressed: u64,
    offset: u64,
    zip64: bool,
    directory: bool,
}

struct Body {
    stream: BoxStream,
    compressor: Option<Compress>,
    crc: crc32fast::Hasher,
    record: Record,
}

enum State {
    Next,
    Body(Box<Body>),
    Finished,
}

/// Encodes a sequence of entries into a ZIP archive as it is read.
pub struct ZipStream {
    entries: VecDeque<ZipEntry>,
    state: State,
    buffer: BytesMut,
    offset: u64,
    records: Vec<Record>,
}

impl ZipStream {
    pub fn new(entries: impl IntoIterator<Item = ZipEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            state: State::Next,
            buffer: BytesMut::new(),
            offset: 0,
            records: Vec::new(),
        }
    }

    fn emit(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.offset += data.len() as u64;
    }

    async fn advance(&mut self, n: usize) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Next => match self.entries.pop_front() {
                Some(entry) => self.start_entry(entry).await,
                None => {
                    self.finish_archive();
                    Ok(())
                }
            },
            State::Body(mut body) => {
                match body.stream.read(n).await? {
                    Some(chunk) => {
                        body.crc.update(&chunk);
                        body.record.uncompressed += chunk.len() as u64;
                        let out = match body.compressor.as_mut() {
                            Some(compressor) => deflate(compressor, &chunk, FlushCompress::None)?,
                            None => chunk.to_vec(),
                        };
                        body.record.compressed += out.len() as u64;
                        self.emit(&out);
                        self.state = State::Body(body);
                    }
                    None => self.finish_entry(*body)?,
                }
                Ok(())
            }
            State::Finished => Ok(()),
        }
    }

    async fn start_entry(&mut self, entry: ZipEntry) -> Result<()> {
        let ZipEntry {
            name,
            modified,
            compression,
            source,
        } = entry;

        let stream = match source {
            EntrySource::Ready(stream) => Some(stream),
            EntrySource::Deferred(open) => Some(open().await?),
            EntrySource::Directory => None,
        };
        tracing::debug!("Zipping entry {}", name);

        let (time, date) = dos_datetime(&modified);
        let mut record = Record {
            name: name.into_bytes(),
            time,
            date,
            method: METHOD_STORED,
            flags: FLAG_UTF8,
            crc: 0,
            compressed: 0,
            uncompressed: 0,
            offset: self.offset,
            zip64: false,
            directory: stream.is_none(),
        };

        let Some(stream) = stream else {
            let header = local_header(&record);
            self.emit(&header);
            self.records.push(record);
            self.state = State::Next;
            return Ok(());
        };

        record.flags |= FLAG_DATA_DESCRIPTOR;
        record.zip64 = stream.size().map_or(true, |size| size >= U32_MAX);
        let compressor = match compression {
            ZipCompression::Stored => None,
            ZipCompression::Deflated => {
                record.method = METHOD_DEFLATED;
                Some(Compress::new(Compression::default(), false))
            }
        };

        let header = local_header(&record);
        self.emit(&header);
        self.state = State::Body(Box::new(Body {
            stream,
            compressor,
            crc: crc32fast::Hasher::new(),
            record,
        }));
        Ok(())
    }

    fn finish_entry(&mut self, body: Body) -> Result<()> {
        let Body {
            compressor,
            crc,
            mut record,
            ..
        } = body;

        if let Some(mut compressor) = compressor {
            let tail = deflate(&mut compressor, &[], FlushCompress::Finish)?;
            record.compressed += tail.len() as u64;
            self.emit(&tail);
        }
        record.crc = crc.finalize();

        if !record.zip64 && (record.compressed >= U32_MAX || record.uncompressed >= U32_MAX) {
            // The local header already promised 4-byte sizes.
            return Err(Error::InvalidInput(format!(
                "entry {} grew past 4 GiB after declaring a smaller size",
                String::from_utf8_lossy(&record.name)
            )));
        }

        let mut descriptor = BytesMut::with_capacity(24);
        descriptor.put_u32_le(DATA_DESCRIPTOR_SIG);
        descriptor.put_u32_le(record.crc);
        if record.zip64 {
            descriptor.put_u64_le(record.compressed);
            descriptor.put_u64_le(record.uncompressed);
        } else {
            descriptor.put_u32_le(record.compressed as u32);
            descriptor.put_u32_le(record.uncompressed as u32);
        }
        self.emit(&descriptor);

        self.records.push(record);
        self.state = State::Next;
        Ok(())
    }

    fn finish_archive(&mut self) {
        let directory_offset = self.offset;
        let records = std::mem::take(&mut self.records);
        for record in &records {
            let header = central_header(record);
            self.emit(&header);
        }
        let directory_size = self.offset - directory_offset;
        let count = records.len() as u64;

        let mut tail = BytesMut::new();
        let needs_zip64 =
            count >= U16_MAX || directory_size >= U32_MAX || directory_offset >= U32_MAX;
        if needs_zip64 {
            let zip64_offset = self.offset;
            tail.put_u32_le(ZIP64_EOCD_SIG);
            tail.put_u64_le(44);
            tail.put_u16_le(VERSION_MADE_BY);
            tail.put_u16_le(VERSION_ZIP64);
            tail.put_u32_le(0);
            tail.put_u32_le(0);
            tail.put_u64_le(count);
            tail.put_u64_le(count);
            tail.put_u64_le(directory_size);
            tail.put_u64_le(directory_offset);

            tail.put_u32_le(ZIP64_LOCATOR_SIG);
            tail.put_u32_le(0);
            tail.put_u64_le(zip64_offset);
            tail.put_u32_le(1);
        }

        tail.put_u32_le(EOCD_SIG);
        tail.put_u16_le(0);
        tail.put_u16_le(0);
        tail.put_u16_le(count.min(U16_MAX) as u16);
        tail.put_u16_le(count.min(U16_MAX) as u16);
        tail.put_u32_le(directory_size.min(U32_MAX) as u32);
        tail.put_u32_le(directory_offset.min(U32_MAX) as u32);
        tail.put_u16_le(0);
        self.emit(&tail);

        self.records = records;
        self.state = State::Finished;
    }
}

#[async_trait]
impl ByteStream for ZipStream {
    fn size(&self) -> Option<u64> {
        None
    }

    async fn read(&mut self, n: usize) -> Result<Option<Bytes>> {
        let n = n.max(1);
        while self.buffer.is_empty() {
            if matches!(self.state, State::Finished) {
                return Ok(None);
            }
            self.advance(n).await?;
        }
        let take = n.min(self.buffer.len());
        Ok(Some(self.buffer.split_to(take).freeze()))
    }

    fn content_type(&self) -> Option<&str> {
        Some("application/zip")
    }
}

fn local_header(record: &Record) -> BytesMut {
    let mut header = BytesMut::with_capacity(30 + record.name.len() + 20);
    header.put_u32_le(LOCAL_HEADER_SIG);
    header.put_u16_le(if record.zip64 {
        VERSION_ZIP64
    } else {
        VERSION_DEFAULT
    });
    header.put_u16_le(record.flags);
    header.put_u16_le(record.method);
    header.put_u16_le(record.time);
    header.put_u16_le(record.date);
    header.put_u32_le(0);
    if record.zip64 {
        header.put_u32_le(U32_MAX as u32);
        header.put_u32_le(U32_MAX as u32);
    } else {
        header.put_u32_le(0);
        header.put_u32_le(0);
    }
    header.put_u16_le(record.name.len() as u16);
    header.put_u16_le(if record.zip64 { 20 } else { 0 });
    header.put_slice(&record.name);
    if record.zip64 {
        header.put_u16_le(ZIP64_EXTRA_ID);
        header.put_u16_le(16);
        header.put_u64_le(0);
        header.put_u64_le(0);
    }
    header
}

fn central_header(record: &Record) -> BytesMut {
    // Only overflowing fields go into the extra block, in this order.
    let mut extra = BytesMut::new();
    if record.uncompressed >= U32_MAX {
        extra.put_u64_le(record.uncompressed);
    }
    if record.compressed >= U32_MAX {
        extra.put_u64_le(record.compressed);
    }
    if record.offset >= U32_MAX {
        extra.put_u64_le(record.offset);
    }

    let external_attributes: u32 = if record.directory {
        (0o40755 << 16) | 0x10
    } else {
        0o100644 << 16
    };
    let version_needed = if record.zip64 || !extra.is_empty() {
        VERSION_ZIP64
    } else {
        VERSION_DEFAULT
    };

    let mut header = BytesMut::with_capacity(46 + record.name.len() + 4 + extra.len());
    header.put_u32_le(CENTRAL_HEADER_SIG);
    header.put_u16_le(VERSION_MADE_BY);
    header.put_u16_le(version_needed);
    header.put_u16_le(record.flags);
    header.put_u16_le(record.method);
    header.put_u16_le(record.time);
    header.put_u16_le(record.date);
    header.put_u32_le(record.crc);
    header.put_u32_le(record.compressed.min(U32_MAX) as u32);
    header.put_u32_le(record.uncompressed.min(U32_MAX) as u32);
    header.put_u16_le(record.name.len() as u16);
    header.put_u16_le(if extra.is_empty() {
        0
    } else {
        4 + extra.len() as u16
    });
    header.put_u16_le(0);
    header.put_u16_le(0);
    header.put_u16_le(0);
    header.put_u32_le(external_attributes);
    header.put_u32_le(record.offset.min(U32_MAX) as u32);
    header.put_slice(&record.name);
    if !extra.is_empty() {
        header.put_u16_le(ZIP64_EXTRA_ID);
        header.put_u16_le(extra.len() as u16);
        header.put_slice(&extra);
    }
    header
}

/// Run `input` through a raw deflate compressor and collect what it emits.
fn deflate(compressor: &mut Compress, mut input: &[u8], flush: FlushCompress) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    loop {
        if out.capacity() - out.len() < 1024 {
            out.reserve(32 * 1024);
        }
        let before = compressor.total_in();
        let status = compressor
            .compress_vec(input, &mut out, flush)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let consumed = (compressor.total_in() - before) as usize;
        input = &input[consumed..];

        match flush {
            FlushCompress::Finish => {
                if status == Status::StreamEnd {
                    break;
                }
            }
            _ => {
                // Output space left over means the compressor has taken
                // everything it can for now.
                if input.is_empty() && out.len() < out.capacity() {
                    break;
                }
            }
        }
    }
    Ok(out)
}

/// MS-DOS time and date. Timestamps before 1980 clamp to 1980-01-01.
fn dos_datetime(dt: &DateTime<Utc>) -> (u16, u16) {
    if dt.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    let time = ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);
    let date = (((dt.year() - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
    (time, date)
}
