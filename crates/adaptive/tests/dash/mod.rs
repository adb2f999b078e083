use std::{sync::Arc, time::Duration};

use iori_adaptive::{
    chunk::{AdaptiveTrackSelection, ChunkSource, LoadingInfo, NextChunk, TrackInfo, TrackSelection},
    config::{AdaptiveConfig, ChunkSourceConfig, TrackerConfig},
    time::ManualClock,
    tracker::LoadKind,
    DashManifestTracker, PlaylistProvider, ResourceState,
};

use crate::{manual_clock, response, start_time, url, AssertWrapper};

const LIVE_MPD: &str = include_str!("../fixtures/dash/live.mpd");

#[test]
fn test_dash_live_edge_chunk() -> anyhow::Result<()> {
    let clock = manual_clock();
    let mut tracker = DashManifestTracker::new(url("live.mpd"), TrackerConfig::default(), clock.clone());
    let loads = tracker.poll_loads();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].kind, LoadKind::Manifest);
    tracker.on_load_completed(loads[0].id, response(&loads[0], LIVE_MPD));
    assert!(matches!(tracker.state(), ResourceState::Live(_)));
    assert!(tracker.is_live());

    let manifest = tracker.manifest().assert_success().clone();
    let period = &manifest.periods[0];
    let set = TrackInfo::main_adaptation_set(period).assert_success();
    let tracks = TrackInfo::from_adaptation_set(&url("live.mpd"), period, set);
    assert_eq!(tracks.len(), 2);
    assert!(tracks.iter().all(|t| tracker.is_snapshot_valid(&t.url)));

    let bandwidths = tracks.iter().map(|t| t.bandwidth).collect();
    let selection = AdaptiveTrackSelection::new(bandwidths, AdaptiveConfig::default());
    let mut source = ChunkSource::new(tracks, selection, ChunkSourceConfig::default(), clock.clone())?;

    let window = tracker.live_window().assert_success().clone();
    let position_us = window.default_start_us();
    let next = source.get_next_chunk(
        &mut tracker,
        &LoadingInfo {
            playback_position_us: position_us,
        },
        position_us,
        None,
        &[],
        false,
    )?;
    let NextChunk::Media(chunk) = next else {
        panic!("expected a media chunk, got {next:?}");
    };

    // the initial estimate only affords the 360p representation
    assert_eq!(source.selection().selected_index(), 0);
    assert_eq!(chunk.track_index, 0);
    assert!((25..=29).contains(&chunk.media_sequence));
    assert_eq!(chunk.url, url(&format!("v360/{}.m4s", chunk.media_sequence)));
    assert_eq!(chunk.end_time_us - chunk.start_time_us, 2_000_000);
    assert!(chunk.start_time_us <= position_us && position_us < chunk.end_time_us);
    let init = chunk.init_segment.assert_success();
    assert_eq!(init.url, url("v360/init.mp4"));

    // the next refresh comes from the minimum update period
    assert_eq!(tracker.next_deadline(), Some(Duration::from_secs(2)));
    Ok(())
}

#[test]
fn test_dash_live_history_is_bounded() {
    // a month after availability start, with no time shift buffer
    let clock = Arc::new(ManualClock::new(start_time() + chrono::Duration::days(30)));
    let config = TrackerConfig {
        max_live_segments: 120,
        ..Default::default()
    };
    let mut tracker = DashManifestTracker::new(url("live.mpd"), config, clock);
    let loads = tracker.poll_loads();
    let mpd = LIVE_MPD.replace(r#"timeShiftBufferDepth="PT10S""#, "");
    tracker.on_load_completed(loads[0].id, response(&loads[0], &mpd));
    assert!(tracker.is_live());

    let manifest = tracker.manifest().assert_success().clone();
    let period = &manifest.periods[0];
    let set = TrackInfo::main_adaptation_set(period).assert_success();
    let tracks = TrackInfo::from_adaptation_set(&url("live.mpd"), period, set);
    let snapshot = tracker.playlist_snapshot(&tracks[0].url, true).assert_success();
    assert_eq!(snapshot.segments.len(), 120);
    // 30 days and 60 seconds of 2 second segments are complete
    let last = 30 * 43_200 + 30 - 1;
    assert_eq!(snapshot.media_sequence, last - 119);
    assert_eq!(
        snapshot.segments[119].url,
        url(&format!("v360/{last}.m4s"))
    );

    let window = tracker.live_window().assert_success();
    assert_eq!(window.duration_us, 240_000_000);
}
