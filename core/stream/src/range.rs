//! Byte ranges for partial downloads.

use serde::{Deserialize, Serialize};
use std::fmt;

use stowage_common::{Error, Result};

/// An inclusive byte range. `end == None` means "to the end of the file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    start: u64,
    end: Option<u64>,
}

impl ByteRange {
    /// Build a range. Reversed bounds are accepted here and rejected by
    /// [`ByteRange::resolve`].
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Parse a `Range` header value of the form `bytes=a-b` or `bytes=a-`.
    ///
    /// Suffix ranges and multi-range requests are not supported and yield
    /// `None`, which callers treat as "send the whole file".
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end = match end.trim() {
            "" => None,
            end => Some(end.parse().ok()?),
        };
        if matches!(end, Some(end) if end < start) {
            return None;
        }
        Some(Self { start, end })
    }

    /// Clamp against a known total size, returning inclusive `(start, end)`.
    ///
    /// # Errors
    /// - `InvalidInput` when `end < start` or `start` is past the end
    pub fn resolve(&self, total: u64) -> Result<(u64, u64)> {
        if let Some(end) = self.end.filter(|end| *end < self.start) {
            return Err(Error::InvalidInput(format!(
                "range end {} before start {}",
                end, self.start
            )));
        }
        if self.start >= total {
            return Err(Error::InvalidInput(format!(
                "range start {} beyond size {}",
                self.start, total
            )));
        }
        let end = self.end.map_or(total - 1, |end| end.min(total - 1));
        Ok((self.start, end))
    }

    /// Render as a `Range` header value.
    pub fn to_header(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "bytes={}-{}", self.start, end),
            None => write!(f, "bytes={}-", self.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(ByteRange::parse("bytes=0-99"), Some(ByteRange::new(0, Some(99))));
        assert_eq!(ByteRange::parse("bytes=100-"), Some(ByteRange::new(100, None)));
        assert_eq!(ByteRange::parse("bytes=-100"), None);
        assert_eq!(ByteRange::parse("bytes=0-1,5-6"), None);
        assert_eq!(ByteRange::parse("items=0-1"), None);
        assert_eq!(ByteRange::parse("bytes=9-3"), None);
    }

    #[test]
    fn test_resolve() {
        assert_eq!(ByteRange::new(0, Some(99)).resolve(50).unwrap(), (0, 49));
        assert_eq!(ByteRange::new(10, None).resolve(50).unwrap(), (10, 49));
        assert!(ByteRange::new(50, None).resolve(50).is_err());
        assert!(matches!(
            ByteRange::new(5, Some(2)).resolve(50),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(ByteRange::new(5, Some(5)).resolve(50).unwrap(), (5, 5));
    }

    #[test]
    fn test_header() {
        assert_eq!(ByteRange::new(5, Some(9)).to_header(), "bytes=5-9");
        assert_eq!(ByteRange::new(5, None).to_header(), "bytes=5-");
    }
}
