//! Digest side-channels for streams in flight.
//!
//! A [`HashStream`] forwards every chunk it hands out to a set of
//! [`StreamWriter`]s. The transfer algorithm keeps a clone of the
//! [`HashWriter`] handle and reads the digest once the destination has
//! consumed the stream.

use async_trait::async_trait;
use bytes::Bytes;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use stowage_common::Result;

use crate::base::ByteStream;

/// Receives a copy of every chunk read through a [`HashStream`].
pub trait StreamWriter: Send + Sync {
    fn write(&self, data: &[u8]);
}

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
    Crc32,
}

impl HashAlgorithm {
    /// Name used as the key in metadata hash maps.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Crc32 => "crc32",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone)]
enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
    Crc32(crc32fast::Hasher),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Crc32(h) => h.update(data),
        }
    }

    fn hexdigest(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Crc32(h) => format!("{:08x}", h.finalize()),
        }
    }
}

struct HashState {
    hasher: Hasher,
    written: u64,
}

/// Shared digest accumulator.
///
/// Cloning returns another handle to the same running digest.
#[derive(Clone)]
pub struct HashWriter {
    algorithm: HashAlgorithm,
    state: Arc<Mutex<HashState>>,
}

impl HashWriter {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let hasher = match algorithm {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
        };
        Self {
            algorithm,
            state: Arc::new(Mutex::new(HashState { hasher, written: 0 })),
        }
    }

    pub fn md5() -> Self {
        Self::new(HashAlgorithm::Md5)
    }

    pub fn sha256() -> Self {
        Self::new(HashAlgorithm::Sha256)
    }

    pub fn crc32() -> Self {
        Self::new(HashAlgorithm::Crc32)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hex digest of everything written so far.
    ///
    /// Does not reset the accumulator.
    pub fn hexdigest(&self) -> String {
        self.lock().hasher.clone().hexdigest()
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().written
    }

    fn lock(&self) -> MutexGuard<'_, HashState> {
        // A panic mid-update cannot leave the hasher half-written.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StreamWriter for HashWriter {
    fn write(&self, data: &[u8]) {
        let mut state = self.lock();
        state.hasher.update(data);
        state.written += data.len() as u64;
    }
}

impl fmt::Debug for HashWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashWriter")
            .field("algorithm", &self.algorithm)
            .field("written", &self.bytes_written())
            .finish()
    }
}

/// Stream decorator that feeds every chunk to its writers before handing it on.
pub struct HashStream<S> {
    inner: S,
    writers: Vec<Box<dyn StreamWriter>>,
}

impl<S: ByteStream> HashStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            writers: Vec::new(),
        }
    }

    pub fn with_writer(mut self, writer: impl StreamWriter + 'static) -> Self {
        self.writers.push(Box::new(writer));
        self
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: ByteStream> ByteStream for HashStream<S> {
    fn size(&self) -> Option<u64> {
        self.inner.size()
    }

    async fn read(&mut self, n: usize) -> Result<Option<Bytes>> {
        let chunk = self.inner.read(n).await?;
        if let Some(data) = &chunk {
            for writer in &self.writers {
                writer.write(data);
            }
        }
        Ok(chunk)
    }

    fn content_type(&self) -> Option<&str> {
        self.inner.content_type()
    }

    fn name(&self) -> Option<&str> {
        self.inner.name()
    }
}
