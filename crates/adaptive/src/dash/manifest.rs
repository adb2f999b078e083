use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use url::Url;

use super::template::{TemplateArgs, UrlTemplate};
use crate::{
    model::{
        ByteRange, InitSegment, MediaPlaylist, PlaylistType, ProtectionSchemes, Segment,
        SegmentBase, ServerControl,
    },
    time::{scale_large_timestamp, TimeUs, MICROS_PER_SECOND},
};

/// A `UTCTiming` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtcTiming {
    pub scheme_id_uri: String,
    pub value: Option<String>,
}

/// A parsed MPD, with every period start resolved and every representation
/// carrying a segment index.
#[derive(Debug, Clone)]
pub struct DashManifest {
    /// `<Location>` advertised by the server for subsequent refreshes.
    pub location: Option<Url>,
    pub base_url: Url,
    pub dynamic: bool,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub publish_time: Option<DateTime<Utc>>,
    pub duration_us: Option<TimeUs>,
    pub min_buffer_time_us: Option<TimeUs>,
    pub min_update_period_us: Option<TimeUs>,
    pub time_shift_buffer_depth_us: Option<TimeUs>,
    pub suggested_presentation_delay_us: Option<TimeUs>,
    pub utc_timing: Vec<UtcTiming>,
    pub periods: Vec<DashPeriod>,
}

impl DashManifest {
    pub fn period_count(&self) -> usize {
        self.periods.len()
    }

    /// Duration of a period, from its own duration, the start of the next period or
    /// the presentation duration.
    pub fn period_duration_us(&self, index: usize) -> Option<TimeUs> {
        let period = self.periods.get(index)?;
        if let Some(duration) = period.duration_us {
            return Some(duration);
        }
        match self.periods.get(index + 1) {
            Some(next) => Some(next.start_us - period.start_us),
            None => self.duration_us.map(|d| d - period.start_us),
        }
    }

    pub fn availability_start_time_us(&self) -> Option<TimeUs> {
        self.availability_start_time.map(|t| t.timestamp_micros())
    }

    /// Wall clock time elapsed since the start of a period, for dynamic manifests.
    pub fn now_in_period_us(&self, index: usize, now_unix_us: TimeUs) -> Option<TimeUs> {
        if !self.dynamic {
            return None;
        }
        let availability_start = self.availability_start_time_us()?;
        let period = self.periods.get(index)?;
        Some(now_unix_us - availability_start - period.start_us)
    }

    /// Identifies a representation across refreshes of this manifest.
    pub fn track_url(manifest_url: &Url, period: &DashPeriod, representation_id: &str) -> Url {
        let mut url = manifest_url.clone();
        url.set_fragment(Some(&format!("period={}&representation={representation_id}", period.key())));
        url
    }

    /// Materializes every representation of every period into a media playlist.
    ///
    /// A dynamic representation keeps at most `max_live_segments` of its most recent
    /// segments.
    pub fn materialize(
        &self,
        manifest_url: &Url,
        now_unix_us: TimeUs,
        max_live_segments: u64,
    ) -> HashMap<Url, Arc<MediaPlaylist>> {
        let mut playlists = HashMap::new();
        for (index, period) in self.periods.iter().enumerate() {
            let period_duration_us = self.period_duration_us(index);
            let now_in_period_us = self.now_in_period_us(index, now_unix_us);
            for adaptation_set in &period.adaptation_sets {
                for representation in &adaptation_set.representations {
                    let playlist = representation.index.materialize(&MaterializeContext {
                        base_url: &representation.base_url,
                        period_start_us: period.start_us,
                        period_duration_us,
                        now_in_period_us,
                        time_shift_buffer_depth_us: self.time_shift_buffer_depth_us,
                        dynamic: self.dynamic,
                        max_live_segments,
                        protection: adaptation_set.protection.clone(),
                    });
                    playlists.insert(
                        Self::track_url(manifest_url, period, &representation.id),
                        Arc::new(playlist),
                    );
                }
            }
        }
        playlists
    }
}

#[derive(Debug, Clone)]
pub struct DashPeriod {
    pub id: Option<String>,
    /// Position in the manifest, kept to identify periods without id.
    pub index: usize,
    /// Start relative to the MPD timeline zero point.
    pub start_us: TimeUs,
    pub duration_us: Option<TimeUs>,
    pub adaptation_sets: Vec<DashAdaptationSet>,
}

impl DashPeriod {
    pub fn key(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => self.index.to_string(),
        }
    }

    pub fn has_audio_or_video(&self) -> bool {
        self.adaptation_sets
            .iter()
            .any(|a| a.content_type.is_audio_or_video())
    }
}

/// Top-level type defined in [RFC6838](https://datatracker.ietf.org/doc/html/rfc6838#section-4.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Image,
    Audio,
    Video,
    Application,
    Unknown,
}

impl ContentType {
    pub fn from_attributes(content_type: Option<&str>, mime_type: Option<&str>) -> Self {
        let kind = content_type.or_else(|| mime_type.and_then(|m| m.split('/').next()));
        match kind {
            Some("text") => Self::Text,
            Some("image") => Self::Image,
            Some("audio") => Self::Audio,
            Some("video") => Self::Video,
            Some("application") => Self::Application,
            _ => Self::Unknown,
        }
    }

    pub fn is_audio_or_video(&self) -> bool {
        matches!(self, Self::Audio | Self::Video)
    }
}

#[derive(Debug, Clone)]
pub struct DashAdaptationSet {
    pub content_type: ContentType,
    pub language: Option<String>,
    pub protection: Option<Arc<ProtectionSchemes>>,
    pub representations: Vec<DashRepresentation>,
}

#[derive(Debug, Clone)]
pub struct DashRepresentation {
    pub id: String,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub base_url: Url,
    pub index: SegmentIndex,
}

/// One `S` element with its repeats expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub start: u64,
    pub duration: u64,
}

/// How the URL of a numbered segment is obtained.
#[derive(Debug, Clone)]
pub enum MediaAddressing {
    Template {
        media: UrlTemplate,
        representation_id: String,
        bandwidth: u64,
    },
    List(Vec<(Url, Option<ByteRange>)>),
}

/// Segment index of a representation described by `SegmentTemplate` or `SegmentList`.
#[derive(Debug, Clone)]
pub struct MultiSegmentIndex {
    pub init: Option<Arc<InitSegment>>,
    pub timescale: u64,
    pub presentation_time_offset: u64,
    pub start_number: u64,
    /// Nominal segment duration in timescale units, when there is no timeline.
    pub duration: Option<u64>,
    pub timeline: Option<Vec<TimelineEntry>>,
    pub availability_time_offset_us: TimeUs,
    pub addressing: MediaAddressing,
}

impl MultiSegmentIndex {
    fn segment_duration_us(&self) -> TimeUs {
        scale_large_timestamp(
            self.duration.unwrap_or(0) as i64,
            MICROS_PER_SECOND,
            self.timescale as i64,
        )
    }

    pub fn first_segment_num(&self) -> u64 {
        self.start_number
    }

    /// `None` when the index is unbounded (live simple addressing).
    pub fn segment_count(&self, period_duration_us: Option<TimeUs>) -> Option<u64> {
        if let MediaAddressing::List(entries) = &self.addressing {
            return Some(entries.len() as u64);
        }
        if let Some(timeline) = &self.timeline {
            return Some(timeline.len() as u64);
        }
        let duration_us = self.segment_duration_us();
        match period_duration_us {
            Some(_) if duration_us <= 0 => Some(0),
            Some(period_duration_us) => {
                Some(((period_duration_us.max(0) + duration_us - 1) / duration_us) as u64)
            }
            None => None,
        }
    }

    pub fn time_us(&self, num: u64) -> TimeUs {
        let unscaled = match &self.timeline {
            Some(timeline) => {
                let index = num.saturating_sub(self.start_number) as usize;
                let start = timeline.get(index).map(|e| e.start).unwrap_or_else(|| {
                    timeline
                        .last()
                        .map(|e| e.start + e.duration)
                        .unwrap_or(self.presentation_time_offset)
                });
                start as i64 - self.presentation_time_offset as i64
            }
            None => (num as i64 - self.start_number as i64) * self.duration.unwrap_or(0) as i64,
        };
        scale_large_timestamp(unscaled, MICROS_PER_SECOND, self.timescale as i64)
    }

    pub fn duration_us(&self, num: u64, period_duration_us: Option<TimeUs>) -> TimeUs {
        if let Some(timeline) = &self.timeline {
            let index = num.saturating_sub(self.start_number) as usize;
            let duration = timeline.get(index).map(|e| e.duration).unwrap_or(0);
            return scale_large_timestamp(duration as i64, MICROS_PER_SECOND, self.timescale as i64);
        }
        match self.segment_count(period_duration_us) {
            Some(count) if count > 0 && num == self.start_number + count - 1 => {
                period_duration_us.unwrap_or(0) - self.time_us(num)
            }
            _ => self.segment_duration_us(),
        }
    }

    pub fn segment_num(&self, time_us: TimeUs, period_duration_us: Option<TimeUs>) -> u64 {
        let first = self.first_segment_num();
        let count = self.segment_count(period_duration_us);
        if count == Some(0) {
            return first;
        }
        if self.timeline.is_none() {
            let duration_us = self.segment_duration_us();
            if duration_us <= 0 {
                return first;
            }
            let num = self.start_number as i64 + time_us.div_euclid(duration_us);
            let num = num.max(first as i64) as u64;
            return match count {
                Some(count) => num.min(first + count - 1),
                None => num,
            };
        }

        let mut low = first as i64;
        let mut high = (first + count.unwrap_or(0)) as i64 - 1;
        while low <= high {
            let mid = low + (high - low) / 2;
            let mid_time = self.time_us(mid as u64);
            if mid_time < time_us {
                low = mid + 1;
            } else if mid_time > time_us {
                high = mid - 1;
            } else {
                return mid as u64;
            }
        }
        if low == first as i64 {
            low as u64
        } else {
            high as u64
        }
    }

    pub fn first_available_segment_num(
        &self,
        period_duration_us: Option<TimeUs>,
        now_in_period_us: Option<TimeUs>,
        time_shift_buffer_depth_us: Option<TimeUs>,
    ) -> u64 {
        let (None, Some(now), Some(depth)) = (
            self.segment_count(period_duration_us),
            now_in_period_us,
            time_shift_buffer_depth_us,
        ) else {
            return self.first_segment_num();
        };
        let buffer_start_num = self.segment_num(now - depth, period_duration_us);
        buffer_start_num.max(self.first_segment_num())
    }

    pub fn available_segment_count(
        &self,
        period_duration_us: Option<TimeUs>,
        now_in_period_us: Option<TimeUs>,
        time_shift_buffer_depth_us: Option<TimeUs>,
    ) -> u64 {
        if let Some(count) = self.segment_count(period_duration_us) {
            return count;
        }
        let Some(now) = now_in_period_us else {
            return 0;
        };
        let available_edge = now + self.availability_time_offset_us;
        // Segment containing the live edge is not complete yet.
        let first_incomplete = self.segment_num(available_edge, period_duration_us);
        let first_available = self.first_available_segment_num(
            period_duration_us,
            now_in_period_us,
            time_shift_buffer_depth_us,
        );
        first_incomplete.saturating_sub(first_available)
    }

    /// Time in the period at which the next segment becomes available, for unbounded indexes.
    pub fn next_segment_available_time_us(
        &self,
        period_duration_us: Option<TimeUs>,
        now_in_period_us: Option<TimeUs>,
        time_shift_buffer_depth_us: Option<TimeUs>,
    ) -> Option<TimeUs> {
        if self.segment_count(period_duration_us).is_some() {
            return None;
        }
        let first = self.first_available_segment_num(
            period_duration_us,
            now_in_period_us,
            time_shift_buffer_depth_us,
        );
        let next = first
            + self.available_segment_count(
                period_duration_us,
                now_in_period_us,
                time_shift_buffer_depth_us,
            );
        Some(
            self.time_us(next) + self.duration_us(next, period_duration_us)
                - self.availability_time_offset_us,
        )
    }

    pub fn segment_url(&self, num: u64) -> Option<(Url, Option<ByteRange>)> {
        match &self.addressing {
            MediaAddressing::List(entries) => {
                let index = num.checked_sub(self.start_number)? as usize;
                entries.get(index).cloned()
            }
            MediaAddressing::Template {
                media,
                representation_id,
                bandwidth,
            } => {
                let time = match &self.timeline {
                    Some(timeline) => {
                        let index = num.checked_sub(self.start_number)? as usize;
                        Some(timeline.get(index)?.start)
                    }
                    None => Some(
                        num.saturating_sub(self.start_number) * self.duration.unwrap_or(0)
                            + self.presentation_time_offset,
                    ),
                };
                let url = media.resolve(TemplateArgs {
                    representation_id,
                    bandwidth: *bandwidth,
                    number: Some(num),
                    time,
                });
                Some((Url::parse(&url).ok()?, None))
            }
        }
    }
}

/// Inputs of [`SegmentIndex::materialize`].
pub struct MaterializeContext<'a> {
    pub base_url: &'a Url,
    pub period_start_us: TimeUs,
    pub period_duration_us: Option<TimeUs>,
    pub now_in_period_us: Option<TimeUs>,
    pub time_shift_buffer_depth_us: Option<TimeUs>,
    pub dynamic: bool,
    /// Bound on the segments of a dynamic index, counted back from the live edge.
    pub max_live_segments: u64,
    pub protection: Option<Arc<ProtectionSchemes>>,
}

#[derive(Debug, Clone)]
pub enum SegmentIndex {
    /// The whole representation is one resource (`SegmentBase` or bare `BaseURL`).
    Single {
        url: Url,
        byte_range: Option<ByteRange>,
        init: Option<Arc<InitSegment>>,
    },
    Multi(MultiSegmentIndex),
}

impl SegmentIndex {
    pub fn is_explicit(&self) -> bool {
        match self {
            Self::Single { .. } => true,
            Self::Multi(index) => index.segment_count(None).is_some(),
        }
    }

    pub fn first_available_segment_num(
        &self,
        period_duration_us: Option<TimeUs>,
        now_in_period_us: Option<TimeUs>,
        time_shift_buffer_depth_us: Option<TimeUs>,
    ) -> u64 {
        match self {
            Self::Single { .. } => 0,
            Self::Multi(index) => index.first_available_segment_num(
                period_duration_us,
                now_in_period_us,
                time_shift_buffer_depth_us,
            ),
        }
    }

    pub fn available_segment_count(
        &self,
        period_duration_us: Option<TimeUs>,
        now_in_period_us: Option<TimeUs>,
        time_shift_buffer_depth_us: Option<TimeUs>,
    ) -> u64 {
        match self {
            Self::Single { .. } => 1,
            Self::Multi(index) => index.available_segment_count(
                period_duration_us,
                now_in_period_us,
                time_shift_buffer_depth_us,
            ),
        }
    }

    /// First segment number and segment count of the available segments.
    ///
    /// With `max_segments`, only the most recent ones are kept. A live index without
    /// time shift buffer would otherwise reach back to the availability start.
    pub fn available_range(
        &self,
        period_duration_us: Option<TimeUs>,
        now_in_period_us: Option<TimeUs>,
        time_shift_buffer_depth_us: Option<TimeUs>,
        max_segments: Option<u64>,
    ) -> (u64, u64) {
        let first = self.first_available_segment_num(
            period_duration_us,
            now_in_period_us,
            time_shift_buffer_depth_us,
        );
        let count = self.available_segment_count(
            period_duration_us,
            now_in_period_us,
            time_shift_buffer_depth_us,
        );
        match max_segments {
            Some(max) if count > max => (first + (count - max), max),
            _ => (first, count),
        }
    }

    pub fn time_us(&self, num: u64) -> TimeUs {
        match self {
            Self::Single { .. } => 0,
            Self::Multi(index) => index.time_us(num),
        }
    }

    /// `None` when the duration of a single-segment representation is unknown.
    pub fn duration_us(&self, num: u64, period_duration_us: Option<TimeUs>) -> Option<TimeUs> {
        match self {
            Self::Single { .. } => period_duration_us,
            Self::Multi(index) => Some(index.duration_us(num, period_duration_us)),
        }
    }

    pub fn next_segment_available_time_us(
        &self,
        period_duration_us: Option<TimeUs>,
        now_in_period_us: Option<TimeUs>,
        time_shift_buffer_depth_us: Option<TimeUs>,
    ) -> Option<TimeUs> {
        match self {
            Self::Single { .. } => None,
            Self::Multi(index) => index.next_segment_available_time_us(
                period_duration_us,
                now_in_period_us,
                time_shift_buffer_depth_us,
            ),
        }
    }

    pub fn init_segment(&self) -> Option<&Arc<InitSegment>> {
        match self {
            Self::Single { init, .. } => init.as_ref(),
            Self::Multi(index) => index.init.as_ref(),
        }
    }

    /// Builds the media playlist of the segments available in the given context.
    ///
    /// The media sequence of the playlist is the DASH segment number of its first segment.
    pub fn materialize(&self, context: &MaterializeContext<'_>) -> MediaPlaylist {
        let (first, count) = self.available_range(
            context.period_duration_us,
            context.now_in_period_us,
            context.time_shift_buffer_depth_us,
            context.dynamic.then_some(context.max_live_segments),
        );
        let first_time_us = self.time_us(first);

        let mut segments = Vec::with_capacity(count as usize);
        let mut target_duration_us = 0;
        for num in first..first + count {
            let (url, byte_range) = match self {
                Self::Single {
                    url, byte_range, ..
                } => (url.clone(), *byte_range),
                Self::Multi(index) => match index.segment_url(num) {
                    Some(resolved) => resolved,
                    None => break,
                },
            };
            let duration_us = self
                .duration_us(num, context.period_duration_us)
                .map(|d| d.max(0) as u64);
            target_duration_us = target_duration_us.max(duration_us.unwrap_or(0));
            segments.push(Segment {
                base: SegmentBase {
                    url,
                    byte_range,
                    duration_us,
                    relative_start_time_us: self.time_us(num) - first_time_us,
                    relative_discontinuity_sequence: 0,
                    init_segment: self.init_segment().cloned(),
                    full_segment_key: None,
                    encryption_iv: None,
                    protection: context.protection.clone(),
                    has_gap: false,
                },
                title: String::new(),
                parts: Vec::new(),
            });
        }

        let duration_us = segments
            .last()
            .map(|s| s.relative_end_time_us().max(0) as u64)
            .unwrap_or(0);
        MediaPlaylist {
            base_url: context.base_url.clone(),
            version: 0,
            playlist_type: (!context.dynamic).then_some(PlaylistType::Vod),
            start_offset_us: None,
            precise_start: false,
            start_time_us: context.period_start_us + first_time_us,
            has_discontinuity_sequence: false,
            discontinuity_sequence: 0,
            media_sequence: first,
            target_duration_us,
            part_target_duration_us: None,
            has_independent_segments: true,
            has_end_tag: !context.dynamic,
            has_program_date_time: false,
            segments,
            trailing_parts: Vec::new(),
            rendition_reports: HashMap::new(),
            server_control: ServerControl::default(),
            protection: context.protection.clone(),
            duration_us,
        }
    }
}
