use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use iori_adaptive::{
    chunk::{
        ChunkSource, FixedTrackSelection, LoadingInfo, MediaChunk, NextChunk, PublicationState,
        SeekMode, TrackInfo,
    },
    config::{ChunkSourceConfig, TrackerConfig},
    time::ManualClock,
    tracker::LoadKind,
    HlsPlaylistTracker, IoriError, IoriResult, PlaylistProvider,
};

use crate::{manual_clock, respond, url, AssertWrapper};

const MULTIVARIANT: &str = include_str!("../fixtures/hls/multivariant.m3u8");
const LIVE_10: &str = include_str!("../fixtures/hls/live_10.m3u8");
const LL_PRELOAD: &str = include_str!("../fixtures/hls/ll_preload.m3u8");
const LL_PUBLISHED: &str = include_str!("../fixtures/hls/ll_published.m3u8");
const LL_REPLACED: &str = include_str!("../fixtures/hls/ll_replaced.m3u8");
const ENCRYPTED_VOD: &str = include_str!("../fixtures/hls/encrypted_vod.m3u8");
const VOD_INDEPENDENT: &str = include_str!("../fixtures/hls/vod_independent.m3u8");
const ENCRYPTED_INIT: &str = include_str!("../fixtures/hls/encrypted_init.m3u8");

type Source = ChunkSource<FixedTrackSelection>;

fn source(tracker: &HlsPlaylistTracker, track: usize, clock: &Arc<ManualClock>) -> Source {
    let tracks = TrackInfo::from_variants(tracker.multivariant_playlist().assert_success());
    ChunkSource::new(
        tracks,
        FixedTrackSelection::new(track),
        ChunkSourceConfig::default(),
        clock.clone(),
    )
    .assert_success()
}

fn media(next: IoriResult<NextChunk>) -> MediaChunk {
    match next {
        Ok(NextChunk::Media(chunk)) => chunk,
        other => panic!("expected a media chunk, got {other:?}"),
    }
}

fn at(position_us: i64) -> LoadingInfo {
    LoadingInfo {
        playback_position_us: position_us,
    }
}

fn loaded(source: &mut Source, mut chunk: MediaChunk) -> MediaChunk {
    source.on_chunk_load_completed(&mut chunk, 100_000, Duration::from_millis(100));
    chunk
}

#[test]
fn test_preload_part_gets_published() {
    let clock = manual_clock();
    let mut tracker = HlsPlaylistTracker::new(url("ll.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut tracker, LoadKind::Manifest, LL_PRELOAD);
    let mut source = source(&tracker, 0, &clock);

    // the live edge resolves to the first part of the segment being produced
    let part0 = media(source.get_next_chunk(&mut tracker, &at(0), 4_000_000, None, &[], false));
    assert_eq!((part0.media_sequence, part0.part_index), (101, Some(0)));
    assert!(part0.is_independent);
    assert!(!part0.is_preload);
    assert_eq!((part0.start_time_us, part0.end_time_us), (4_000_000, 5_000_000));
    let queue = vec![loaded(&mut source, part0)];

    let hinted = media(source.get_next_chunk(&mut tracker, &at(0), 5_000_000, Some(0), &queue, false));
    assert_eq!((hinted.media_sequence, hinted.part_index), (101, Some(1)));
    assert!(hinted.is_preload);
    assert_eq!(hinted.url, url("p101.1.mp4"));
    assert_eq!(
        source.chunk_publication_state(&mut tracker, &hinted),
        PublicationState::Preload
    );

    // the blocking reload lists the hinted part
    let request = respond(&mut tracker, LoadKind::Playlist, LL_PUBLISHED);
    assert_eq!(request.url.query(), Some("_HLS_msn=101&_HLS_part=1"));
    assert_eq!(
        source.chunk_publication_state(&mut tracker, &hinted),
        PublicationState::Published
    );
    assert_eq!(
        source.chunk_publication_state(&mut tracker, &queue[0]),
        PublicationState::Published
    );

    // a later refresh replacing the part withdraws it
    respond(&mut tracker, LoadKind::Playlist, LL_REPLACED);
    assert_eq!(
        source.chunk_publication_state(&mut tracker, &hinted),
        PublicationState::Removed
    );
}

#[test]
fn test_spliced_preload_part_is_deferred() {
    let clock = manual_clock();
    let mut tracker = HlsPlaylistTracker::new(url("ll.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut tracker, LoadKind::Manifest, LL_PRELOAD);
    let mut source = source(&tracker, 0, &clock);

    let part0 = media(source.get_next_chunk(&mut tracker, &at(0), 4_000_000, None, &[], false));
    assert_eq!((part0.media_sequence, part0.part_index), (101, Some(0)));

    // the hinted part depends on a part still loading
    let queue = vec![part0];
    let next = source.get_next_chunk(&mut tracker, &at(0), 5_000_000, Some(0), &queue, false);
    assert!(matches!(next, Ok(NextChunk::Deferred)), "got {next:?}");

    // once published it is spliced in as a regular part
    respond(&mut tracker, LoadKind::Playlist, LL_PUBLISHED);
    let part1 = media(source.get_next_chunk(&mut tracker, &at(0), 5_000_000, Some(0), &queue, false));
    assert_eq!((part1.media_sequence, part1.part_index), (101, Some(1)));
    assert!(!part1.is_preload);
    assert!(part1.should_splice);
}

#[test]
fn test_init_segment_key_is_requested_first() {
    let clock = manual_clock();
    let mut tracker = HlsPlaylistTracker::new(url("vod.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut tracker, LoadKind::Manifest, ENCRYPTED_INIT);
    let mut source = source(&tracker, 0, &clock);

    let init_key = match source.get_next_chunk(&mut tracker, &at(0), 0, None, &[], false) {
        Ok(NextChunk::Key(request)) => request,
        other => panic!("expected a key request, got {other:?}"),
    };
    assert_eq!(init_key.url, url("init.key"));
    assert!(init_key.for_init_segment);
    assert_eq!(init_key.track_index, 0);
    source.on_key_loaded(init_key.url, Bytes::from_static(&[1; 16]));

    let media_key = match source.get_next_chunk(&mut tracker, &at(0), 0, None, &[], false) {
        Ok(NextChunk::Key(request)) => request,
        other => panic!("expected a key request, got {other:?}"),
    };
    assert_eq!(media_key.url, url("media.key"));
    assert!(!media_key.for_init_segment);
    source.on_key_loaded(media_key.url, Bytes::from_static(&[2; 16]));

    let chunk = media(source.get_next_chunk(&mut tracker, &at(0), 0, None, &[], false));
    assert_eq!(chunk.url, url("seg0.mp4"));
    let init = chunk.init_segment.assert_success();
    assert_eq!(init.url, url("init.mp4"));
    assert_eq!(init.full_segment_key, Some(url("init.key")));
    assert_eq!(chunk.init_segment_key, Some(Bytes::from_static(&[1; 16])));
    assert_eq!(chunk.key, Some(Bytes::from_static(&[2; 16])));
}

fn two_tracks() -> (Arc<ManualClock>, HlsPlaylistTracker) {
    let clock = manual_clock();
    let mut tracker = HlsPlaylistTracker::new(url("master.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut tracker, LoadKind::Manifest, MULTIVARIANT);
    respond(&mut tracker, LoadKind::Playlist, LIVE_10);
    tracker.refresh_playlist(&url("high.m3u8"));
    respond(&mut tracker, LoadKind::Playlist, LIVE_10);
    assert!(tracker.is_snapshot_valid(&url("low.m3u8")));
    assert!(tracker.is_snapshot_valid(&url("high.m3u8")));
    (clock, tracker)
}

#[test]
fn test_switch_never_loads_consumed_position() {
    let (clock, mut tracker) = two_tracks();
    let mut low = source(&tracker, 0, &clock);
    let first = media(low.get_next_chunk(&mut tracker, &at(0), 0, None, &[], false));
    let queue = vec![loaded(&mut low, first)];
    let second = media(low.get_next_chunk(&mut tracker, &at(0), 4_000_000, None, &queue, false));
    let queue = vec![queue[0].clone(), loaded(&mut low, second)];
    assert_eq!(queue[1].media_sequence, 11);

    // switching restarts at segment 11, which starts at 4s
    let mut high = source(&tracker, 1, &clock);
    let next = media(high.get_next_chunk(&mut tracker, &at(6_000_000), 8_000_000, Some(6_000_000), &queue, false));
    assert_eq!(next.track_index, 0);
    assert_eq!(next.media_sequence, 12);
    assert_eq!(next.start_time_us, 8_000_000);

    let mut high = source(&tracker, 1, &clock);
    let next = media(high.get_next_chunk(&mut tracker, &at(3_000_000), 8_000_000, Some(3_000_000), &queue, false));
    assert_eq!(next.track_index, 1);
    assert_eq!(next.media_sequence, 11);
    assert_eq!(next.playlist_url, url("high.m3u8"));
    assert!(next.should_splice);
}

#[test]
fn test_track_exclusion() -> anyhow::Result<()> {
    let (clock, mut tracker) = two_tracks();
    let mut source = source(&tracker, 1, &clock);

    assert!(source.on_playlist_error(&mut tracker, &url("high.m3u8"), Some(Duration::from_secs(60))));
    assert!(source.is_excluded(1));
    let next = media(source.get_next_chunk(&mut tracker, &at(0), 0, None, &[], false));
    assert_eq!(next.track_index, 0);

    // the last usable track stays
    assert!(matches!(
        source.exclude_track(0, Duration::from_secs(60)),
        Err(IoriError::TrackExclusionExhausted(0))
    ));

    clock.advance(Duration::from_secs(61));
    assert!(!source.is_excluded(1));
    source.exclude_track(0, Duration::from_secs(10))?;
    assert!(source.is_excluded(0));
    Ok(())
}

#[test]
fn test_blocks_on_expired_snapshot() {
    let clock = manual_clock();
    let mut tracker = HlsPlaylistTracker::new(url("index.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut tracker, LoadKind::Manifest, LIVE_10);
    let mut source = source(&tracker, 0, &clock);

    clock.advance(Duration::from_secs(31));
    let next = source.get_next_chunk(&mut tracker, &at(0), 0, None, &[], false);
    assert!(matches!(next, Ok(NextChunk::BlockedOnPlaylist(ref u)) if *u == url("index.m3u8")));
    assert!(source.failed_expected_playlist().is_none());

    let loads = tracker.poll_loads();
    assert_eq!(loads.len(), 1);
    tracker.on_load_error(
        loads[0].id,
        IoriError::HttpError(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
    );
    assert!(source.on_playlist_error(&mut tracker, &url("index.m3u8"), None));
    assert_eq!(source.failed_expected_playlist(), Some(&url("index.m3u8")));
}

#[test]
fn test_keys_are_requested_before_media() {
    let clock = manual_clock();
    let mut tracker = HlsPlaylistTracker::new(url("vod.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut tracker, LoadKind::Manifest, ENCRYPTED_VOD);
    assert!(!tracker.is_live());
    let mut source = source(&tracker, 0, &clock);

    let key1 = match source.get_next_chunk(&mut tracker, &at(0), 0, None, &[], false) {
        Ok(NextChunk::Key(request)) => request,
        other => panic!("expected a key request, got {other:?}"),
    };
    assert_eq!(key1.url, url("key1.bin"));
    assert!(!key1.for_init_segment);
    source.on_key_loaded(key1.url.clone(), Bytes::from_static(&[1; 16]));

    let enc0 = media(source.get_next_chunk(&mut tracker, &at(0), 0, None, &[], false));
    assert_eq!(enc0.url, url("enc0.ts"));
    assert_eq!(enc0.key, Some(Bytes::from_static(&[1; 16])));
    assert!(enc0.iv.is_some());

    let mut queue = vec![loaded(&mut source, enc0)];
    let enc1 = media(source.get_next_chunk(&mut tracker, &at(0), 4_000_000, None, &queue, false));
    assert_eq!(enc1.url, url("enc1.ts"));
    queue.push(loaded(&mut source, enc1));

    let key2 = match source.get_next_chunk(&mut tracker, &at(0), 8_000_000, None, &queue, false) {
        Ok(NextChunk::Key(request)) => request,
        other => panic!("expected a key request, got {other:?}"),
    };
    assert_eq!(key2.url, url("key2.bin"));
    source.on_key_loaded(key2.url, Bytes::from_static(&[2; 16]));
    assert_eq!(source.key_cache().len(), 2);

    let enc2 = media(source.get_next_chunk(&mut tracker, &at(0), 8_000_000, None, &queue, false));
    queue.push(loaded(&mut source, enc2));

    // past the end of an ended playlist
    let end = source.get_next_chunk(&mut tracker, &at(0), 12_000_000, None, &queue, true);
    assert!(matches!(end, Ok(NextChunk::EndOfStream)));
    let tail = media(source.get_next_chunk(&mut tracker, &at(0), 12_000_000, None, &queue, false));
    assert_eq!(tail.media_sequence, 2);
}

#[test]
fn test_adjusted_seek_position() {
    let clock = manual_clock();
    let mut tracker = HlsPlaylistTracker::new(url("vod.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut tracker, LoadKind::Manifest, VOD_INDEPENDENT);
    let source = source(&tracker, 0, &clock);

    let seek = |tracker: &mut HlsPlaylistTracker, position_us, mode| {
        source.adjusted_seek_position_us(tracker, position_us, mode)
    };
    assert_eq!(seek(&mut tracker, 5_000_000, SeekMode::Exact), 5_000_000);
    assert_eq!(seek(&mut tracker, 5_000_000, SeekMode::ClosestSync), 4_000_000);
    assert_eq!(seek(&mut tracker, 7_000_000, SeekMode::ClosestSync), 8_000_000);
    assert_eq!(seek(&mut tracker, 7_000_000, SeekMode::PreviousSync), 4_000_000);
    assert_eq!(seek(&mut tracker, 5_000_000, SeekMode::NextSync), 8_000_000);

    // without independent segments there are no known sync points
    let mut encrypted = HlsPlaylistTracker::new(url("vod.m3u8"), TrackerConfig::default(), clock.clone());
    respond(&mut encrypted, LoadKind::Manifest, ENCRYPTED_VOD);
    assert_eq!(
        source.adjusted_seek_position_us(&mut encrypted, 5_000_000, SeekMode::ClosestSync),
        5_000_000
    );
}
