use std::{sync::Arc, time::Duration};

use iori_adaptive::{
    chunk::TrackInfo,
    config::TrackerConfig,
    fetch::Response,
    model::MediaPlaylist,
    time::{SharedClock, TimeUs},
    tracker::{LiveWindow, LoadId, LoadRequest, TrackerEvent},
    DashManifestTracker, HlsPlaylistTracker, IoriError, PlaylistProvider,
};
use reqwest::Url;

/// Either kind of manifest tracker, chosen from the manifest URL.
pub enum Tracker {
    Hls(HlsPlaylistTracker),
    Dash(DashManifestTracker),
}

impl Tracker {
    pub fn new(url: Url, config: TrackerConfig, clock: SharedClock) -> Self {
        if url.path().ends_with(".mpd") {
            Self::Dash(DashManifestTracker::new(url, config, clock))
        } else {
            Self::Hls(HlsPlaylistTracker::new(url, config, clock))
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hls(_) => "HLS",
            Self::Dash(_) => "DASH",
        }
    }

    pub fn poll_loads(&mut self) -> Vec<LoadRequest> {
        match self {
            Self::Hls(tracker) => tracker.poll_loads(),
            Self::Dash(tracker) => tracker.poll_loads(),
        }
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        match self {
            Self::Hls(tracker) => tracker.next_deadline(),
            Self::Dash(tracker) => tracker.next_deadline(),
        }
    }

    pub fn on_load_completed(&mut self, id: LoadId, response: Response) {
        match self {
            Self::Hls(tracker) => tracker.on_load_completed(id, response),
            Self::Dash(tracker) => tracker.on_load_completed(id, response),
        }
    }

    pub fn on_load_error(&mut self, id: LoadId, error: IoriError) {
        match self {
            Self::Hls(tracker) => tracker.on_load_error(id, error),
            Self::Dash(tracker) => tracker.on_load_error(id, error),
        }
    }

    pub fn fatal_error(&self) -> Option<&IoriError> {
        match self {
            Self::Hls(tracker) => tracker.fatal_error(),
            Self::Dash(tracker) => tracker.fatal_error(),
        }
    }

    pub fn live_window(&self) -> Option<&LiveWindow> {
        match self {
            Self::Hls(tracker) => tracker.live_window(),
            Self::Dash(tracker) => tracker.live_window(),
        }
    }

    /// Playlists whose last load failed since the previous call.
    pub fn failed_playlists(&mut self) -> Vec<Url> {
        let Self::Hls(tracker) = self else {
            return Vec::new();
        };
        tracker
            .poll_events()
            .into_iter()
            .filter_map(|event| match event {
                TrackerEvent::PlaylistError { url } => Some(url),
                _ => None,
            })
            .collect()
    }

    /// Tracks to select from, once the manifest is known.
    ///
    /// A DASH presentation is followed through the main adaptation set of its first period.
    pub fn tracks(&self, manifest_url: &Url) -> Option<Vec<TrackInfo>> {
        match self {
            Self::Hls(tracker) => tracker.multivariant_playlist().map(|m| TrackInfo::from_variants(m)),
            Self::Dash(tracker) => {
                let period = tracker.manifest()?.periods.first()?;
                let set = TrackInfo::main_adaptation_set(period)?;
                Some(TrackInfo::from_adaptation_set(manifest_url, period, set))
            }
        }
    }
}

impl PlaylistProvider for Tracker {
    fn is_snapshot_valid(&self, url: &Url) -> bool {
        match self {
            Self::Hls(tracker) => tracker.is_snapshot_valid(url),
            Self::Dash(tracker) => tracker.is_snapshot_valid(url),
        }
    }

    fn playlist_snapshot(&mut self, url: &Url, for_playback: bool) -> Option<Arc<MediaPlaylist>> {
        match self {
            Self::Hls(tracker) => tracker.playlist_snapshot(url, for_playback),
            Self::Dash(tracker) => tracker.playlist_snapshot(url, for_playback),
        }
    }

    fn initial_start_time_us(&self) -> TimeUs {
        match self {
            Self::Hls(tracker) => tracker.initial_start_time_us(),
            Self::Dash(tracker) => tracker.initial_start_time_us(),
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Self::Hls(tracker) => tracker.is_live(),
            Self::Dash(tracker) => tracker.is_live(),
        }
    }

    fn refresh_playlist(&mut self, url: &Url) {
        match self {
            Self::Hls(tracker) => tracker.refresh_playlist(url),
            Self::Dash(tracker) => tracker.refresh_playlist(url),
        }
    }

    fn exclude_media_playlist(&mut self, url: &Url, exclusion: Duration) -> bool {
        match self {
            Self::Hls(tracker) => tracker.exclude_media_playlist(url, exclusion),
            Self::Dash(tracker) => tracker.exclude_media_playlist(url, exclusion),
        }
    }

    fn deactivate_playlist_for_playback(&mut self, url: &Url) {
        match self {
            Self::Hls(tracker) => tracker.deactivate_playlist_for_playback(url),
            Self::Dash(tracker) => tracker.deactivate_playlist_for_playback(url),
        }
    }
}
