//! Stream layer for the Stowage gateway.
//!
//! Payloads move between an inbound request, a backend HTTP call and an
//! optional transform (hashing, zip) as single-pass byte streams that are
//! pulled chunk by chunk. Nothing in this crate buffers a whole file.
//!
//! # Design Principles
//! - Pull-based: the consumer asks for the next chunk, which gives the
//!   relay backpressure for free
//! - One contract: every variant exposes the same `read(n)` so relaying code
//!   never cares where the bytes come from
//! - Side effects by decoration: hashing wraps a stream instead of patching it

pub mod base;
pub mod cutoff;
pub mod file;
pub mod hash;
pub mod multi;
pub mod range;
pub mod response;
pub mod string;
pub mod zip;

pub use base::{into_stream, read_to_end, BoxStream, ByteStream};
pub use cutoff::CutoffStream;
pub use file::FileStream;
pub use hash::{HashAlgorithm, HashStream, HashWriter, StreamWriter};
pub use multi::MultiStream;
pub use range::ByteRange;
pub use response::{transport_error, ResponseStream};
pub use string::{EmptyStream, StringStream};
pub use zip::{ZipCompression, ZipEntry, ZipStream};
