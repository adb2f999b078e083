use std::{ops::Deref, sync::Arc};

use url::Url;

use super::ByteRange;
use crate::time::TimeUs;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyMethod {
    None,
    Aes128,
    SampleAes,
    SampleAesCtr,
    SampleAesCenc,
    Other(String),
}

impl From<&str> for KeyMethod {
    fn from(value: &str) -> Self {
        match value {
            "NONE" => Self::None,
            "AES-128" => Self::Aes128,
            "SAMPLE-AES" => Self::SampleAes,
            "SAMPLE-AES-CTR" => Self::SampleAesCtr,
            "SAMPLE-AES-CENC" => Self::SampleAesCenc,
            other => Self::Other(other.to_string()),
        }
    }
}

pub const IDENTITY_KEY_FORMAT: &str = "identity";

/// One encryption key declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub method: KeyMethod,
    pub uri: Option<Url>,
    pub iv: Option<String>,
    pub key_format: String,
    pub key_format_versions: Option<String>,
}

/// Sample-level protection schemes, one entry per key format in declaration order.
///
/// Declaring a key format again replaces the earlier entry in place, so several
/// concurrent DRM systems keep their relative order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectionSchemes {
    entries: Vec<KeyDescriptor>,
}

impl ProtectionSchemes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: KeyDescriptor) {
        match self
            .entries
            .iter_mut()
            .find(|k| k.key_format == key.key_format)
        {
            Some(existing) => *existing = key,
            None => self.entries.push(key),
        }
    }

    pub fn get(&self, key_format: &str) -> Option<&KeyDescriptor> {
        self.entries.iter().find(|k| k.key_format == key_format)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<KeyDescriptor> for ProtectionSchemes {
    fn from_iter<T: IntoIterator<Item = KeyDescriptor>>(iter: T) -> Self {
        let mut schemes = Self::new();
        for key in iter {
            schemes.insert(key);
        }
        schemes
    }
}

/// Initialization data shared by the media units that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSegment {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    pub full_segment_key: Option<Url>,
    pub encryption_iv: Option<String>,
}

/// Fields shared by segments and parts.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentBase {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    /// `None` when the duration is not known yet, e.g. for preload hints.
    pub duration_us: Option<u64>,
    /// Start time relative to the start of the playlist.
    pub relative_start_time_us: TimeUs,
    /// Discontinuity sequence relative to the playlist's discontinuity sequence.
    pub relative_discontinuity_sequence: u32,
    pub init_segment: Option<Arc<InitSegment>>,
    /// URL of the key decrypting the whole resource (AES-128).
    pub full_segment_key: Option<Url>,
    pub encryption_iv: Option<String>,
    pub protection: Option<Arc<ProtectionSchemes>>,
    pub has_gap: bool,
}

impl SegmentBase {
    pub fn duration_or_zero(&self) -> u64 {
        self.duration_us.unwrap_or(0)
    }

    pub fn relative_end_time_us(&self) -> TimeUs {
        self.relative_start_time_us + self.duration_or_zero() as TimeUs
    }
}

/// A whole media segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub base: SegmentBase,
    pub title: String,
    /// Partial segments making up this segment, if the playlist advertised them.
    pub parts: Vec<Part>,
}

impl Segment {
    /// Returns a copy positioned at another place of the timeline.
    pub fn rebased(&self, relative_start_time_us: TimeUs, relative_discontinuity_sequence: u32) -> Self {
        let offset = relative_start_time_us - self.base.relative_start_time_us;
        let mut segment = self.clone();
        segment.base.relative_start_time_us = relative_start_time_us;
        segment.base.relative_discontinuity_sequence = relative_discontinuity_sequence;
        for part in segment.parts.iter_mut() {
            part.base.relative_start_time_us += offset;
            part.base.relative_discontinuity_sequence = relative_discontinuity_sequence;
        }
        segment
    }
}

impl Deref for Segment {
    type Target = SegmentBase;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

/// A partial segment of a low-latency playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub base: SegmentBase,
    /// Decoding can start at this part without any preceding data.
    pub is_independent: bool,
    /// Advertised as a hint. Neither its duration nor its existence is guaranteed yet.
    pub is_preload: bool,
}

impl Part {
    pub fn is_gap(&self) -> bool {
        self.base.has_gap
    }
}

impl Deref for Part {
    type Target = SegmentBase;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
