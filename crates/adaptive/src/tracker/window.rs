use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    config::TrackerConfig,
    dash::DashManifest,
    model::{MediaPlaylist, Part, Segment},
    time::{ms_to_us, TimeUs, MICROS_PER_MILLI},
};

/// The seekable range of a presentation at one instant.
///
/// `start_us` is on the timeline chunk times are expressed in. The default start
/// position and every live offset are relative to the window.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveWindow {
    pub start_us: TimeUs,
    pub duration_us: TimeUs,
    pub default_start_position_us: TimeUs,
    /// Preferred distance from the live edge. `None` for on-demand content.
    pub target_live_offset_us: Option<TimeUs>,
    pub min_live_offset_us: Option<TimeUs>,
    pub max_live_offset_us: Option<TimeUs>,
    pub is_dynamic: bool,
    /// Wall clock time of the window start, when the manifest anchors it.
    pub window_start_unix: Option<DateTime<Utc>>,
}

impl LiveWindow {
    pub fn end_us(&self) -> TimeUs {
        self.start_us + self.duration_us
    }

    pub fn default_start_us(&self) -> TimeUs {
        self.start_us + self.default_start_position_us
    }
}

/// `value` limited to `[min, max]`, preferring `min` when the bounds cross.
fn constrain(value: TimeUs, min: TimeUs, max: TimeUs) -> TimeUs {
    min.max(value.min(max))
}

fn indexed_adaptation_sets(
    manifest: &DashManifest,
    period_index: usize,
) -> impl Iterator<Item = &crate::dash::SegmentIndex> {
    let period = &manifest.periods[period_index];
    let audio_or_video = period.has_audio_or_video();
    period
        .adaptation_sets
        .iter()
        .filter(move |set| !audio_or_video || set.content_type.is_audio_or_video())
        .filter_map(|set| set.representations.first().map(|r| &r.index))
}

fn available_start_us(
    manifest: &DashManifest,
    period_index: usize,
    now_unix_us: TimeUs,
    config: &TrackerConfig,
) -> TimeUs {
    let period = &manifest.periods[period_index];
    let period_duration_us = manifest.period_duration_us(period_index);
    let now_in_period_us = manifest.now_in_period_us(period_index, now_unix_us);
    let depth = manifest.time_shift_buffer_depth_us;
    let max_segments = manifest.dynamic.then_some(config.max_live_segments);

    let mut available_start = period.start_us;
    for index in indexed_adaptation_sets(manifest, period_index) {
        let (first, count) =
            index.available_range(period_duration_us, now_in_period_us, depth, max_segments);
        if count == 0 {
            return period.start_us;
        }
        available_start = available_start.max(period.start_us + index.time_us(first));
    }
    available_start
}

fn available_end_us(manifest: &DashManifest, period_index: usize, now_unix_us: TimeUs) -> TimeUs {
    let period = &manifest.periods[period_index];
    let period_duration_us = manifest.period_duration_us(period_index);
    let now_in_period_us = manifest.now_in_period_us(period_index, now_unix_us);
    let depth = manifest.time_shift_buffer_depth_us;

    let mut available_end = TimeUs::MAX;
    for index in indexed_adaptation_sets(manifest, period_index) {
        let count = index.available_segment_count(period_duration_us, now_in_period_us, depth);
        if count == 0 {
            return period.start_us;
        }
        let last = index.first_available_segment_num(period_duration_us, now_in_period_us, depth)
            + count
            - 1;
        let end = period.start_us
            + index.time_us(last)
            + index.duration_us(last, period_duration_us).unwrap_or(0);
        available_end = available_end.min(end);
    }
    if available_end == TimeUs::MAX {
        period.start_us + period_duration_us.unwrap_or(0)
    } else {
        available_end
    }
}

/// A live window whose end moves with the clock alone, without a manifest update.
pub fn window_changes_implicitly(manifest: &DashManifest) -> bool {
    manifest.dynamic
        && manifest.periods.last().is_some_and(|period| {
            period
                .adaptation_sets
                .iter()
                .flat_map(|set| set.representations.first())
                .any(|representation| !representation.index.is_explicit())
        })
}

/// Target, minimum and maximum live offsets of a dynamic DASH window.
fn dash_live_offsets(
    manifest: &DashManifest,
    now_in_window_us: TimeUs,
    window_duration_us: TimeUs,
    config: &TrackerConfig,
) -> (TimeUs, TimeUs, TimeUs) {
    let live = &config.live;
    let max_offset = live.max_offset_ms.map(ms_to_us).unwrap_or(now_in_window_us);
    let min_offset = match live.min_offset_ms {
        Some(min) => ms_to_us(min),
        None => {
            let mut min = now_in_window_us - window_duration_us;
            // The clock is inside the window, assume clocks are in sync.
            if min < 0 && max_offset > 0 {
                min = 0;
            }
            if let Some(min_buffer_time) = manifest.min_buffer_time_us {
                min = (min + min_buffer_time).min(max_offset);
            }
            min
        }
    };

    let mut target = live
        .target_offset_ms
        .map(ms_to_us)
        .or(manifest.suggested_presentation_delay_us)
        .unwrap_or_else(|| ms_to_us(config.fallback_target_live_offset_ms));
    if target < min_offset {
        target = min_offset;
    }
    if target > max_offset {
        let safe_distance = config.min_live_default_start_us().min(window_duration_us / 2);
        target = constrain(now_in_window_us - safe_distance, min_offset, max_offset);
    }
    (target, min_offset, max_offset)
}

/// Derives the window of a DASH presentation at `now_unix_us` (server time).
pub fn dash_live_window(manifest: &DashManifest, now_unix_us: TimeUs, config: &TrackerConfig) -> LiveWindow {
    let Some(last) = manifest.periods.len().checked_sub(1) else {
        return LiveWindow {
            start_us: 0,
            duration_us: 0,
            default_start_position_us: 0,
            target_live_offset_us: None,
            min_live_offset_us: None,
            max_live_offset_us: None,
            is_dynamic: manifest.dynamic,
            window_start_unix: None,
        };
    };

    let mut start_us = available_start_us(manifest, 0, now_unix_us, config);
    let end_us = available_end_us(manifest, last, now_unix_us);
    if window_changes_implicitly(manifest) {
        if let Some(depth) = manifest.time_shift_buffer_depth_us {
            start_us = start_us.max(end_us - depth);
        }
    }
    let duration_us = end_us - start_us;

    if !manifest.dynamic {
        return LiveWindow {
            start_us,
            duration_us,
            default_start_position_us: 0,
            target_live_offset_us: None,
            min_live_offset_us: None,
            max_live_offset_us: None,
            is_dynamic: false,
            window_start_unix: None,
        };
    }

    let window_start_unix_us = manifest.availability_start_time_us().unwrap_or(0) + start_us;
    let now_in_window_us = now_unix_us - window_start_unix_us;
    let (target, min, max) = dash_live_offsets(manifest, now_in_window_us, duration_us, config);

    let minimum_default_position = config.min_live_default_start_us().min(duration_us / 2);
    let default_start_position_us = (now_in_window_us - target).max(minimum_default_position);

    LiveWindow {
        start_us,
        duration_us,
        default_start_position_us,
        target_live_offset_us: Some(target),
        min_live_offset_us: Some(min),
        max_live_offset_us: Some(max),
        is_dynamic: true,
        window_start_unix: DateTime::from_timestamp_micros(window_start_unix_us),
    }
}

/// Interval until some segment index of the last period changes.
///
/// Refreshes landing within 100ms of the default interval are merged into it.
pub fn dash_refresh_interval(manifest: &DashManifest, now_unix_us: TimeUs, config: &TrackerConfig) -> Duration {
    let default_us = ms_to_us(config.default_refresh_interval_ms);
    let Some(period_index) = manifest.periods.len().checked_sub(1) else {
        return Duration::from_millis(config.default_refresh_interval_ms);
    };
    let period = &manifest.periods[period_index];
    let period_duration_us = manifest.period_duration_us(period_index);
    let now_in_period_us = manifest.now_in_period_us(period_index, now_unix_us);

    let mut interval_us = default_us;
    for set in &period.adaptation_sets {
        let Some(representation) = set.representations.first() else {
            continue;
        };
        let Some(next_available_us) = representation.index.next_segment_available_time_us(
            period_duration_us,
            now_in_period_us,
            manifest.time_shift_buffer_depth_us,
        ) else {
            continue;
        };
        let required_us = next_available_us - now_in_period_us.unwrap_or(0);
        if required_us < interval_us - 100_000
            || (required_us > interval_us && required_us < interval_us + 100_000)
        {
            interval_us = required_us;
        }
    }

    let interval_ms = (interval_us.max(0) + MICROS_PER_MILLI - 1) / MICROS_PER_MILLI;
    Duration::from_millis(interval_ms as u64)
}

/// Interval between network refreshes of a dynamic DASH manifest, counted from the
/// start of the previous load.
pub fn dash_min_update_period(manifest: &DashManifest, config: &TrackerConfig) -> Option<Duration> {
    if !manifest.dynamic {
        return None;
    }
    manifest.min_update_period_us.map(|period| match period {
        0 => Duration::from_millis(config.zero_min_update_period_ms),
        period => Duration::from_micros(period.max(0) as u64),
    })
}

/// Index of the last segment starting at or before `position_us`, clamped to the list.
pub(crate) fn floor_segment_index(segments: &[Segment], position_us: TimeUs) -> usize {
    segments
        .partition_point(|segment| segment.relative_start_time_us <= position_us)
        .saturating_sub(1)
}

fn closest_preceding_independent_part(parts: &[Part], position_us: TimeUs) -> Option<&Part> {
    let mut closest = None;
    for part in parts {
        if part.relative_start_time_us > position_us {
            break;
        }
        if part.is_independent {
            closest = Some(part);
        }
    }
    closest
}

/// Distance between the end of the playlist and the wall clock, when the playlist
/// is anchored by program date times.
fn hls_live_edge_offset_us(playlist: &MediaPlaylist, now_unix_us: TimeUs) -> TimeUs {
    if playlist.has_program_date_time {
        now_unix_us - playlist.end_time_us()
    } else {
        0
    }
}

fn hls_target_offset_us(playlist: &MediaPlaylist, live_edge_offset_us: TimeUs) -> TimeUs {
    let server_control = &playlist.server_control;
    let target = if let Some(start_offset) = playlist.start_offset_us {
        playlist.duration_us as TimeUs - start_offset
    } else if let (Some(part_hold_back), Some(_)) =
        (server_control.part_hold_back_us, playlist.part_target_duration_us)
    {
        part_hold_back
    } else if let Some(hold_back) = server_control.hold_back_us {
        hold_back
    } else {
        3 * playlist.target_duration_us as TimeUs
    };
    target + live_edge_offset_us
}

fn hls_live_default_start_us(playlist: &MediaPlaylist, live_edge_offset_us: TimeUs, target_us: TimeUs) -> TimeUs {
    let position = playlist
        .start_offset_us
        .unwrap_or(playlist.duration_us as TimeUs + live_edge_offset_us - target_us);
    if playlist.precise_start {
        return position;
    }
    if let Some(part) = closest_preceding_independent_part(&playlist.trailing_parts, position) {
        return part.relative_start_time_us;
    }
    if playlist.segments.is_empty() {
        return 0;
    }
    let segment = &playlist.segments[floor_segment_index(&playlist.segments, position)];
    match closest_preceding_independent_part(&segment.parts, position) {
        Some(part) => part.relative_start_time_us,
        None => segment.relative_start_time_us,
    }
}

/// Derives the window of the primary HLS playlist.
///
/// `is_live` is whether the first primary snapshot had no end tag; a live
/// presentation keeps a live window after it ends.
pub fn hls_live_window(
    playlist: &MediaPlaylist,
    initial_start_time_us: TimeUs,
    is_live: bool,
    now_unix_us: TimeUs,
    config: &TrackerConfig,
) -> LiveWindow {
    let start_us = playlist.start_time_us - initial_start_time_us;
    let duration_us = playlist.duration_us as TimeUs;
    let window_start_unix = playlist
        .has_program_date_time
        .then(|| DateTime::from_timestamp_micros(playlist.start_time_us))
        .flatten();

    if !is_live {
        let default_start_position_us = match playlist.start_offset_us {
            Some(_) if playlist.segments.is_empty() => 0,
            Some(offset) if playlist.precise_start || offset == duration_us => offset,
            Some(offset) => {
                playlist.segments[floor_segment_index(&playlist.segments, offset)].relative_start_time_us
            }
            None => 0,
        };
        return LiveWindow {
            start_us,
            duration_us,
            default_start_position_us,
            target_live_offset_us: None,
            min_live_offset_us: None,
            max_live_offset_us: None,
            is_dynamic: false,
            window_start_unix,
        };
    }

    let live_edge_offset_us = hls_live_edge_offset_us(playlist, now_unix_us);
    let target = config
        .live
        .target_offset_ms
        .map(ms_to_us)
        .unwrap_or_else(|| hls_target_offset_us(playlist, live_edge_offset_us));
    let min = live_edge_offset_us;
    let max = duration_us + live_edge_offset_us;
    let target = constrain(target, min, max);

    LiveWindow {
        start_us,
        duration_us,
        default_start_position_us: hls_live_default_start_us(playlist, live_edge_offset_us, target),
        target_live_offset_us: Some(target),
        min_live_offset_us: Some(min),
        max_live_offset_us: Some(max),
        is_dynamic: !playlist.has_end_tag,
        window_start_unix,
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::{dash::parse_mpd, hls::parse_media_playlist, hls::ParseContext};

    const LIVE_MPD: &str = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic"
     availabilityStartTime="2024-01-01T00:00:00Z"
     timeShiftBufferDepth="PT20S" minBufferTime="PT2S" suggestedPresentationDelay="PT6S">
  <Period id="0" start="PT0S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1" duration="2" startNumber="0" media="v/$Number$.m4s"/>
      <Representation id="v" bandwidth="1000000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    fn now_unix_us(offset_secs: i64) -> TimeUs {
        (1_704_067_200 + offset_secs) * 1_000_000
    }

    #[test]
    fn test_dash_live_window() {
        let url = Url::parse("https://example.com/live.mpd").unwrap();
        let manifest = parse_mpd(LIVE_MPD, &url).unwrap();
        let config = TrackerConfig::default();

        // 101s after availability start: segments [40, 50) are complete
        let window = dash_live_window(&manifest, now_unix_us(101), &config);
        assert!(window.is_dynamic);
        assert_eq!(window.start_us, 80_000_000);
        assert_eq!(window.duration_us, 20_000_000);
        assert_eq!(window.target_live_offset_us, Some(6_000_000));
        // min offset: now is 1s past the window end, plus minBufferTime
        assert_eq!(window.min_live_offset_us, Some(3_000_000));
        assert_eq!(window.default_start_position_us, 15_000_000);
        assert_eq!(
            window.window_start_unix.unwrap().timestamp(),
            1_704_067_200 + 80
        );
        assert!(window_changes_implicitly(&manifest));
        assert_eq!(dash_min_update_period(&manifest, &config), None);

        // next segment (50) completes at 102s
        assert_eq!(
            dash_refresh_interval(&manifest, now_unix_us(101), &config),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_dash_refresh_hysteresis() {
        let url = Url::parse("https://example.com/live.mpd").unwrap();
        let manifest = parse_mpd(&LIVE_MPD.replace("duration=\"2\"", "duration=\"6\""), &url).unwrap();
        let config = TrackerConfig::default();
        // the segment [96s, 102s) completes 50ms after the default interval: wait for it
        let now = now_unix_us(97) - 50_000;
        assert_eq!(
            dash_refresh_interval(&manifest, now, &config),
            Duration::from_micros(5_050_000)
        );
    }

    #[test]
    fn test_zero_min_update_period() {
        let url = Url::parse("https://example.com/live.mpd").unwrap();
        let manifest = parse_mpd(
            &LIVE_MPD.replace("type=\"dynamic\"", "type=\"dynamic\" minimumUpdatePeriod=\"PT0S\""),
            &url,
        )
        .unwrap();
        assert_eq!(
            dash_min_update_period(&manifest, &TrackerConfig::default()),
            Some(Duration::from_secs(5))
        );
    }

    const LL_PLAYLIST: &str = "#EXTM3U
#EXT-X-VERSION:9
#EXT-X-TARGETDURATION:4
#EXT-X-PART-INF:PART-TARGET=1.0
#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK=1.5
#EXT-X-MEDIA-SEQUENCE:100
#EXTINF:4.0,
s100.ts
#EXT-X-PART:DURATION=1.0,URI=\"p101.0.ts\",INDEPENDENT=YES
#EXT-X-PART:DURATION=1.0,URI=\"p101.1.ts\"
#EXT-X-PART:DURATION=1.0,URI=\"p101.2.ts\",INDEPENDENT=YES
#EXT-X-PART:DURATION=1.0,URI=\"p101.3.ts\"
#EXTINF:4.0,
s101.ts
#EXT-X-PART:DURATION=1.0,URI=\"p102.0.ts\",INDEPENDENT=YES
#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"p102.1.ts\"
";

    #[test]
    fn test_hls_default_start_snaps_to_independent_part() {
        let url = Url::parse("https://example.com/ll.m3u8").unwrap();
        let playlist = parse_media_playlist(LL_PLAYLIST, &url, ParseContext::default()).unwrap();
        let window = hls_live_window(&playlist, 0, true, 0, &TrackerConfig::default());
        assert_eq!(window.duration_us, 8_000_000);
        assert_eq!(window.target_live_offset_us, Some(1_500_000));
        // 6.5s snaps back to the independent part at 6s
        assert_eq!(window.default_start_position_us, 6_000_000);
        assert!(window.is_dynamic);
    }

    #[test]
    fn test_dash_window_without_time_shift_buffer_is_bounded() {
        let url = Url::parse("https://example.com/live.mpd").unwrap();
        let manifest = parse_mpd(&LIVE_MPD.replace("timeShiftBufferDepth=\"PT20S\"", ""), &url).unwrap();
        assert_eq!(manifest.time_shift_buffer_depth_us, None);
        let config = TrackerConfig {
            max_live_segments: 50,
            ..Default::default()
        };

        // 30 days in: 1296000 segments are complete, the window keeps the last 50
        let window = dash_live_window(&manifest, now_unix_us(30 * 86_400 + 1), &config);
        assert_eq!(window.duration_us, 100_000_000);
        assert_eq!(window.end_us(), 30 * 86_400 * 1_000_000);
    }

    #[test]
    fn test_window_is_deterministic() {
        let url = Url::parse("https://example.com/live.mpd").unwrap();
        let manifest = parse_mpd(LIVE_MPD, &url).unwrap();
        let config = TrackerConfig::default();
        let now = now_unix_us(333);
        assert_eq!(
            dash_live_window(&manifest, now, &config),
            dash_live_window(&manifest, now, &config)
        );
        assert_eq!(
            dash_refresh_interval(&manifest, now, &config),
            dash_refresh_interval(&manifest, now, &config)
        );
    }
}
