//! Chunk selection.
//!
//! A [`ChunkSource`] walks the media playlist snapshots of a set of
//! interchangeable tracks and decides, one call at a time, which unit to load
//! next. Positions are expressed on the tracker's timeline: zero is the start of
//! the first primary snapshot for HLS, and the manifest time origin for DASH.

mod iterator;
mod selection;
mod source;

use bytes::Bytes;
use url::Url;

pub use iterator::{ChunkDescriptor, MediaChunkIterator};
pub use selection::*;
pub use source::{ChunkSource, LoadingInfo};

use crate::{
    dash::{ContentType, DashAdaptationSet, DashManifest, DashPeriod},
    model::{ByteRange, InitSegment, MultivariantPlaylist, Resolution},
    time::TimeUs,
};

/// One selectable encoding, addressed by the URL of its media playlist snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub url: Url,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub resolution: Option<Resolution>,
}

impl TrackInfo {
    /// Variants of a multivariant playlist, in declaration order.
    pub fn from_variants(playlist: &MultivariantPlaylist) -> Vec<Self> {
        playlist
            .variants
            .iter()
            .map(|variant| Self {
                url: variant.url.clone(),
                bandwidth: variant.bandwidth,
                codecs: variant.codecs.clone(),
                resolution: variant.resolution,
            })
            .collect()
    }

    /// Representations of a DASH adaptation set, keyed like the tracker keys their snapshots.
    pub fn from_adaptation_set(manifest_url: &Url, period: &DashPeriod, set: &DashAdaptationSet) -> Vec<Self> {
        set.representations
            .iter()
            .map(|representation| Self {
                url: DashManifest::track_url(manifest_url, period, &representation.id),
                bandwidth: representation.bandwidth,
                codecs: representation.codecs.clone(),
                resolution: representation
                    .width
                    .zip(representation.height)
                    .map(|(width, height)| Resolution { width, height }),
            })
            .collect()
    }

    /// Picks the adaptation set to follow in a period: video first, then anything.
    pub fn main_adaptation_set(period: &DashPeriod) -> Option<&DashAdaptationSet> {
        period
            .adaptation_sets
            .iter()
            .find(|set| set.content_type == ContentType::Video)
            .or_else(|| period.adaptation_sets.first())
    }
}

/// A media unit to load, either a whole segment or a part of one.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaChunk {
    pub track_index: usize,
    pub playlist_url: Url,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    pub media_sequence: u64,
    /// Index of the part within its segment, `None` for a whole segment.
    pub part_index: Option<usize>,
    pub start_time_us: TimeUs,
    pub end_time_us: TimeUs,
    pub is_preload: bool,
    /// Decoding can start at this chunk without earlier data.
    pub is_independent: bool,
    /// Samples must be spliced against the tail of the buffered queue.
    pub should_splice: bool,
    pub discontinuity_sequence: u32,
    pub init_segment: Option<InitSegment>,
    pub init_segment_key: Option<Bytes>,
    pub key: Option<Bytes>,
    pub iv: Option<String>,
    /// Set by the owner once the chunk has been fully loaded.
    pub load_completed: bool,
}

impl MediaChunk {
    pub fn duration_us(&self) -> TimeUs {
        self.end_time_us - self.start_time_us
    }

    /// Media sequence following this chunk when it is a whole segment.
    pub fn next_media_sequence(&self) -> u64 {
        self.media_sequence + 1
    }
}

/// A decryption key that has to be loaded before the media it protects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub url: Url,
    pub track_index: usize,
    pub for_init_segment: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NextChunk {
    Media(MediaChunk),
    Key(KeyRequest),
    EndOfStream,
    /// The snapshot of this playlist is too old or missing. A refresh has been requested.
    BlockedOnPlaylist(Url),
    /// Nothing should be loaded right now. Ask again after the next playlist refresh.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationState {
    /// Announced by a preload hint, may still change.
    Preload,
    Published,
    /// Gone from the latest snapshot. Buffered samples of it should be discarded.
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Exact,
    PreviousSync,
    NextSync,
    ClosestSync,
}

impl SeekMode {
    /// Picks the seek target among two sync positions around `position_us`.
    pub fn resolve(self, position_us: TimeUs, first_sync_us: TimeUs, second_sync_us: TimeUs) -> TimeUs {
        let (before, after) = match self {
            Self::Exact => return position_us,
            Self::PreviousSync => (TimeUs::MAX, 0),
            Self::NextSync => (0, TimeUs::MAX),
            Self::ClosestSync => (TimeUs::MAX, TimeUs::MAX),
        };
        let min = position_us.saturating_sub(before);
        let max = position_us.saturating_add(after);
        let first_valid = (min..=max).contains(&first_sync_us);
        let second_valid = (min..=max).contains(&second_sync_us);
        match (first_valid, second_valid) {
            (true, true) => {
                if (first_sync_us - position_us).abs() <= (second_sync_us - position_us).abs() {
                    first_sync_us
                } else {
                    second_sync_us
                }
            }
            (true, false) => first_sync_us,
            (false, true) => second_sync_us,
            (false, false) => min,
        }
    }
}
