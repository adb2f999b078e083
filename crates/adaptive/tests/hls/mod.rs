use std::{sync::Arc, time::Duration};

use iori_adaptive::{
    chunk::{ChunkSource, FixedTrackSelection, LoadingInfo, NextChunk, TrackInfo},
    config::{ChunkSourceConfig, TrackerConfig},
    hls::{parse_media_playlist, ParseContext},
    tracker::LoadKind,
    HlsPlaylistTracker, IoriError, PlaylistProvider,
};

use crate::{manual_clock, respond, url, AssertWrapper};

const LIVE_10: &str = include_str!("../fixtures/hls/live_10.m3u8");
const LIVE_11: &str = include_str!("../fixtures/hls/live_11.m3u8");
const LIVE_11_DELTA: &str = include_str!("../fixtures/hls/live_11_delta.m3u8");
const LIVE_17: &str = include_str!("../fixtures/hls/live_17.m3u8");

#[test]
fn test_live_delta_then_behind_window() -> anyhow::Result<()> {
    let clock = manual_clock();
    let mut tracker = HlsPlaylistTracker::new(url("index.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut tracker, LoadKind::Manifest, LIVE_10);
    assert!(tracker.is_live());

    let tracks = TrackInfo::from_variants(tracker.multivariant_playlist().assert_success());
    let mut source = ChunkSource::new(
        tracks,
        FixedTrackSelection::new(0),
        ChunkSourceConfig::default(),
        clock.clone(),
    )?;

    // an empty queue starts at the requested position
    let NextChunk::Media(mut first) =
        source.get_next_chunk(&mut tracker, &LoadingInfo::default(), 0, None, &[], false)?
    else {
        panic!("expected a media chunk");
    };
    assert_eq!(first.media_sequence, 10);
    assert_eq!(first.url, url("seg10.ts"));
    assert_eq!((first.start_time_us, first.end_time_us), (0, 4_000_000));
    source.on_chunk_load_completed(&mut first, 250_000, Duration::from_millis(200));

    // the server drops segment 10 and appends 13, skipping 11
    clock.advance(Duration::from_secs(4));
    let request = respond(&mut tracker, LoadKind::Playlist, LIVE_11_DELTA);
    assert_eq!(request.url.query(), Some("_HLS_skip=YES"));
    let snapshot = tracker.primary_snapshot().assert_success();
    assert_eq!(snapshot.media_sequence, 11);
    assert_eq!(snapshot.segments.len(), 3);
    assert_eq!(snapshot.segments[0].url, url("seg11.ts"));
    assert_eq!(snapshot.start_time_us, 4_000_000);

    // continuing after segment 10 picks 11, which is still listed
    let queue = vec![first];
    let NextChunk::Media(mut second) = source.get_next_chunk(
        &mut tracker,
        &LoadingInfo {
            playback_position_us: 1_000_000,
        },
        4_000_000,
        Some(1_000_000),
        &queue,
        false,
    )?
    else {
        panic!("expected a media chunk");
    };
    assert_eq!(second.media_sequence, 11);
    assert_eq!(second.url, url("seg11.ts"));
    assert_eq!(second.start_time_us, 4_000_000);
    assert!(!second.should_splice);
    source.on_chunk_load_completed(&mut second, 250_000, Duration::from_millis(200));

    // two windows later, segment 12 is long gone
    clock.advance(Duration::from_secs(4));
    respond(&mut tracker, LoadKind::Playlist, LIVE_17);
    assert_eq!(tracker.primary_snapshot().assert_success().media_sequence, 17);
    let result = source.get_next_chunk(
        &mut tracker,
        &LoadingInfo {
            playback_position_us: 5_000_000,
        },
        8_000_000,
        Some(5_000_000),
        &[second],
        false,
    );
    assert!(matches!(result, Err(IoriError::BehindLiveWindow)));
    Ok(())
}

#[test]
fn test_delta_update_matches_inline_segments() -> anyhow::Result<()> {
    let base = url("index.m3u8");
    let previous = parse_media_playlist(LIVE_10, &base, ParseContext::default())?;
    let delta = parse_media_playlist(
        LIVE_11_DELTA,
        &base,
        ParseContext {
            multivariant: None,
            previous: Some(&previous),
        },
    )?;
    let inline = parse_media_playlist(LIVE_11, &base, ParseContext::default())?;

    assert_eq!(delta.media_sequence, inline.media_sequence);
    assert_eq!(delta.segments, inline.segments);
    assert_eq!(delta.duration_us, inline.duration_us);
    Ok(())
}

#[test]
fn test_regressing_refresh_is_rejected() {
    let clock = manual_clock();
    let mut tracker = HlsPlaylistTracker::new(url("index.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut tracker, LoadKind::Manifest, LIVE_11);
    let accepted = tracker.primary_snapshot().assert_success().clone();

    clock.advance(Duration::from_secs(4));
    respond(&mut tracker, LoadKind::Playlist, LIVE_10);
    let active = tracker.primary_snapshot().assert_success();
    assert!(Arc::ptr_eq(&accepted, active));
    assert_eq!(active.media_sequence, 11);
    assert!(tracker.playlist_error(&url("index.m3u8")).is_none());

    // an unchanged playlist is reloaded after half a target duration
    assert_eq!(tracker.next_deadline(), Some(Duration::from_secs(6)));
}

#[test]
fn test_failed_delta_falls_back_to_full_reload() {
    let clock = manual_clock();
    let mut tracker = HlsPlaylistTracker::new(url("index.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut tracker, LoadKind::Manifest, LIVE_17);

    // the skipped segments are not in the snapshot the delta refers to
    clock.advance(Duration::from_secs(4));
    respond(&mut tracker, LoadKind::Playlist, LIVE_11_DELTA);
    assert_eq!(tracker.primary_snapshot().assert_success().media_sequence, 17);

    let loads = tracker.poll_loads();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].url, url("index.m3u8"));
    assert!(tracker.poll_events().iter().all(|e| !matches!(
        e,
        iori_adaptive::tracker::TrackerEvent::PlaylistError { .. }
    )));
}

#[test]
fn test_delta_with_oversized_skip_is_rejected() -> anyhow::Result<()> {
    let base = url("index.m3u8");
    let previous = parse_media_playlist(LIVE_10, &base, ParseContext::default())?;
    let context = || ParseContext {
        multivariant: None,
        previous: Some(&previous),
    };

    let overflowing = LIVE_11_DELTA.replace("SKIPPED-SEGMENTS=1", "SKIPPED-SEGMENTS=18446744073709551615");
    match parse_media_playlist(&overflowing, &base, context()) {
        Err(IoriError::DeltaUpdateFailed {
            media_sequence,
            skipped,
        }) => {
            assert_eq!(media_sequence, 11);
            assert_eq!(skipped, u64::MAX);
        }
        other => panic!("expected a failed delta update, got {other:?}"),
    }

    // segment 10 plus three skipped ones run past the previous snapshot
    let too_long = LIVE_11_DELTA.replace("SKIPPED-SEGMENTS=1", "SKIPPED-SEGMENTS=3");
    assert!(matches!(
        parse_media_playlist(&too_long, &base, context()),
        Err(IoriError::DeltaUpdateFailed { skipped: 3, .. })
    ));
    Ok(())
}
