use std::{collections::HashMap, sync::Arc};

use url::Url;

use super::{KeyDescriptor, Part, ProtectionSchemes, Segment, SegmentBase};
use crate::time::TimeUs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Vod,
    Event,
}

/// Low-latency delivery directives announced by the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerControl {
    /// Delta updates may skip segments older than this from the live edge.
    pub skip_until_us: Option<TimeUs>,
    pub can_skip_date_ranges: bool,
    pub hold_back_us: Option<TimeUs>,
    pub part_hold_back_us: Option<TimeUs>,
    pub can_block_reload: bool,
}

/// Last known position of a sibling playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionReport {
    pub url: Url,
    pub last_media_sequence: u64,
    /// `None` when the reporting playlist has no parts.
    pub last_part_index: Option<usize>,
}

/// An immutable snapshot of a media playlist.
///
/// DASH representations are materialized into the same shape, so the chunk source
/// only ever walks this type.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub base_url: Url,
    pub version: u32,
    pub playlist_type: Option<PlaylistType>,
    /// Preferred start offset into the playlist. Negative values count from the end.
    pub start_offset_us: Option<TimeUs>,
    pub precise_start: bool,
    /// Start time of the first segment on the tracker's timeline.
    pub start_time_us: TimeUs,
    pub has_discontinuity_sequence: bool,
    pub discontinuity_sequence: u32,
    /// Media sequence number of the first segment.
    pub media_sequence: u64,
    pub target_duration_us: u64,
    pub part_target_duration_us: Option<u64>,
    pub has_independent_segments: bool,
    pub has_end_tag: bool,
    pub has_program_date_time: bool,
    pub segments: Vec<Segment>,
    /// Parts at the live edge that are not part of a complete segment yet.
    pub trailing_parts: Vec<Part>,
    pub rendition_reports: HashMap<Url, RenditionReport>,
    pub server_control: ServerControl,
    /// Schemes protecting the playlist as a whole, without key URIs bound to a segment.
    pub protection: Option<Arc<ProtectionSchemes>>,
    /// Sum of all segment durations.
    pub duration_us: u64,
}

impl MediaPlaylist {
    /// Whether new content may still be appended to this playlist.
    pub fn is_dynamic(&self) -> bool {
        !self.has_end_tag && self.playlist_type != Some(PlaylistType::Vod)
    }

    pub fn end_time_us(&self) -> TimeUs {
        self.start_time_us + self.duration_us as TimeUs
    }

    /// Media sequence after the last complete segment.
    pub fn next_media_sequence(&self) -> u64 {
        self.media_sequence + self.segments.len() as u64
    }

    /// Whether this snapshot should replace `other` of the same playlist.
    pub fn is_newer_than(&self, other: Option<&MediaPlaylist>) -> bool {
        let Some(other) = other else {
            return true;
        };
        if self.media_sequence != other.media_sequence {
            return self.media_sequence > other.media_sequence;
        }
        if self.segments.len() != other.segments.len() {
            return self.segments.len() > other.segments.len();
        }
        let parts = self.trailing_parts.len();
        let other_parts = other.trailing_parts.len();
        parts > other_parts || (parts == other_parts && self.has_end_tag && !other.has_end_tag)
    }

    pub fn copy_with(&self, start_time_us: TimeUs, discontinuity_sequence: u32) -> Self {
        Self {
            start_time_us,
            discontinuity_sequence,
            has_discontinuity_sequence: true,
            ..self.clone()
        }
    }

    pub fn copy_with_end_tag(&self) -> Self {
        if self.has_end_tag {
            return self.clone();
        }
        Self {
            has_end_tag: true,
            ..self.clone()
        }
    }

    pub fn segment(&self, media_sequence: u64) -> Option<&Segment> {
        let index = media_sequence.checked_sub(self.media_sequence)?;
        self.segments.get(index as usize)
    }

    /// Resolves a media sequence number and optional part index to a loadable unit.
    ///
    /// The media sequence one past the last segment addresses the trailing parts.
    pub fn segment_base(&self, media_sequence: u64, part_index: Option<usize>) -> Option<&SegmentBase> {
        let index = media_sequence.checked_sub(self.media_sequence)? as usize;
        match (self.segments.get(index), part_index) {
            (Some(segment), None) => Some(&segment.base),
            (Some(segment), Some(part)) => segment.parts.get(part).map(|p| &p.base),
            (None, Some(part)) if index == self.segments.len() => {
                self.trailing_parts.get(part).map(|p| &p.base)
            }
            _ => None,
        }
    }

    pub fn part(&self, media_sequence: u64, part_index: usize) -> Option<&Part> {
        let index = media_sequence.checked_sub(self.media_sequence)? as usize;
        match self.segments.get(index) {
            Some(segment) => segment.parts.get(part_index),
            None if index == self.segments.len() => self.trailing_parts.get(part_index),
            None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u64,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub url: Url,
    pub bandwidth: u64,
    pub average_bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f64>,
    pub audio_group_id: Option<String>,
    pub video_group_id: Option<String>,
    pub subtitles_group_id: Option<String>,
    pub closed_captions_group_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenditionKind {
    Audio,
    Video,
    Subtitles,
    ClosedCaptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rendition {
    pub kind: RenditionKind,
    /// Absent for closed captions and for renditions muxed into the variant.
    pub url: Option<Url>,
    pub group_id: String,
    pub name: String,
    pub language: Option<String>,
    pub is_default: bool,
    pub autoselect: bool,
    pub characteristics: Option<String>,
    pub channels: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultivariantPlaylist {
    pub base_url: Url,
    pub variants: Vec<Variant>,
    pub renditions: Vec<Rendition>,
    pub session_keys: Vec<KeyDescriptor>,
    pub has_independent_segments: bool,
    pub variable_definitions: HashMap<String, String>,
}

impl MultivariantPlaylist {
    /// Wraps a lone media playlist URL so it can be tracked like a variant.
    pub fn single_variant(url: Url) -> Self {
        Self {
            base_url: url.clone(),
            variants: vec![Variant {
                url,
                bandwidth: 0,
                average_bandwidth: None,
                codecs: None,
                resolution: None,
                frame_rate: None,
                audio_group_id: None,
                video_group_id: None,
                subtitles_group_id: None,
                closed_captions_group_id: None,
            }],
            renditions: Vec::new(),
            session_keys: Vec::new(),
            has_independent_segments: false,
            variable_definitions: HashMap::new(),
        }
    }

    /// URLs of every media playlist referenced by this playlist, variants first.
    pub fn media_playlist_urls(&self) -> Vec<Url> {
        let mut urls: Vec<Url> = self.variants.iter().map(|v| v.url.clone()).collect();
        for url in self.renditions.iter().filter_map(|r| r.url.as_ref()) {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Multivariant(MultivariantPlaylist),
    Media(MediaPlaylist),
}
