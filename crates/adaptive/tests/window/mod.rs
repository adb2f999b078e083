use std::time::Duration;

use iori_adaptive::{
    config::TrackerConfig,
    dash::parse_mpd,
    hls::{parse_media_playlist, ParseContext},
    tracker::{dash_live_window, dash_min_update_period, dash_refresh_interval, hls_live_window},
};

use crate::{start_time, url};

const LIVE_MPD: &str = include_str!("../fixtures/dash/live.mpd");
const LIVE_10: &str = include_str!("../fixtures/hls/live_10.m3u8");

#[test]
fn test_dash_window_is_deterministic() -> anyhow::Result<()> {
    let config = TrackerConfig::default();
    let manifest = parse_mpd(LIVE_MPD, &url("live.mpd"))?;
    assert!(manifest.dynamic);
    assert_eq!(manifest.periods.len(), 1);

    let now_us = start_time().timestamp_micros();
    let first = dash_live_window(&manifest, now_us, &config);
    let second = dash_live_window(&manifest, now_us, &config);
    assert_eq!(first, second);
    assert!(first.is_dynamic);
    // 10s of time shift ending at the last complete segment
    assert_eq!((first.start_us, first.end_us()), (50_000_000, 60_000_000));
    assert!(first.default_start_us() >= first.start_us);
    assert!(first.default_start_us() <= first.end_us());

    assert_eq!(
        dash_refresh_interval(&manifest, now_us, &config),
        dash_refresh_interval(&manifest, now_us, &config)
    );
    assert_eq!(
        dash_min_update_period(&manifest, &config),
        Some(Duration::from_secs(2))
    );
    Ok(())
}

#[test]
fn test_hls_window_is_deterministic() -> anyhow::Result<()> {
    let config = TrackerConfig::default();
    let playlist = parse_media_playlist(LIVE_10, &url("index.m3u8"), ParseContext::default())?;
    let now_us = start_time().timestamp_micros();

    let first = hls_live_window(&playlist, playlist.start_time_us, true, now_us, &config);
    let second = hls_live_window(&playlist, playlist.start_time_us, true, now_us, &config);
    assert_eq!(first, second);
    assert!(first.is_dynamic);
    assert_eq!((first.start_us, first.duration_us), (0, 12_000_000));
    assert!(first.default_start_us() <= first.end_us());
    Ok(())
}
