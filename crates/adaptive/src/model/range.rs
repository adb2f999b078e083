use std::str::FromStr;

use crate::error::IoriError;

/// A byte range inside a resource. `length == None` reads until the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// Offset of the first byte after this range, if the range is bounded.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|length| self.offset + length)
    }

    pub fn to_http_range(&self) -> String {
        match self.length {
            Some(0) => format!("bytes={}-{}", self.offset, self.offset),
            Some(length) => format!("bytes={}-{}", self.offset, self.offset + length - 1),
            None => format!("bytes={}-", self.offset),
        }
    }

    /// Parses a DASH `mediaRange` / `indexRange` of the form `first-last` (inclusive).
    pub fn from_dash_range(range: &str) -> Option<Self> {
        let (first, last) = range.split_once('-')?;
        let first: u64 = first.trim().parse().ok()?;
        let last = last.trim();
        if last.is_empty() {
            return Some(Self::new(first, None));
        }
        let last: u64 = last.parse().ok()?;
        (last >= first).then(|| Self::new(first, Some(last - first + 1)))
    }
}

/// HLS `<length>[@<offset>]` byte range, before the implicit offset is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HlsByteRange {
    pub length: u64,
    pub offset: Option<u64>,
}

impl HlsByteRange {
    /// Resolves the offset against the end of the previous sub-range of the same resource.
    pub fn resolve(self, previous_end: Option<u64>) -> ByteRange {
        ByteRange::new(
            self.offset.or(previous_end).unwrap_or(0),
            Some(self.length),
        )
    }
}

impl FromStr for HlsByteRange {
    type Err = IoriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IoriError::parse(0, format!("invalid byte range: {s}"));
        let (length, offset) = match s.split_once('@') {
            Some((length, offset)) => (length, Some(offset)),
            None => (s, None),
        };
        let length = length.trim().parse().map_err(|_| invalid())?;
        let offset = offset
            .map(|o| o.trim().parse().map_err(|_| invalid()))
            .transpose()?;
        Ok(Self { length, offset })
    }
}
