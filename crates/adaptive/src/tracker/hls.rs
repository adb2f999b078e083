use std::{sync::Arc, time::Duration};

use url::Url;

use super::{
    window::hls_live_window, LiveWindow, LoadId, LoadKind, LoadRequest, PlaylistProvider,
    ResourceState,
};
use crate::{
    config::TrackerConfig,
    error::IoriError,
    fetch::Response,
    hls::{parse_media_playlist, parse_playlist, ParseContext, BLOCK_MSN_PARAM, BLOCK_PART_PARAM, SKIP_PARAM},
    model::{MediaPlaylist, MultivariantPlaylist, Playlist, PlaylistType, Segment},
    time::{us_to_duration, SharedClock, TimeUs},
};

/// Notifications for the owner of a [`HlsPlaylistTracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// The primary playlist got a new snapshot.
    PrimaryPlaylistRefreshed,
    /// Any media playlist got a new snapshot.
    PlaylistChanged(Url),
    /// Loading or refreshing a playlist failed. The error is kept until the next
    /// successful refresh, see [`HlsPlaylistTracker::playlist_error`].
    PlaylistError { url: Url },
}

struct InFlight {
    id: LoadId,
    url: Url,
    started_at: Duration,
}

impl InFlight {
    fn is_blocking(&self) -> bool {
        self.url.query_pairs().any(|(k, _)| k == BLOCK_MSN_PARAM)
    }
}

/// Refresh state of one media playlist.
struct MediaPlaylistBundle {
    url: Url,
    snapshot: Option<Arc<MediaPlaylist>>,
    last_snapshot_load_at: Duration,
    last_snapshot_change_at: Duration,
    earliest_next_load_at: Duration,
    exclude_until: Duration,
    active_for_playback: bool,

    in_flight: Option<InFlight>,
    /// Next request to issue once `earliest_next_load_at` has passed.
    pending: Option<Url>,
    error: Option<IoriError>,
    error_count: u32,
}

impl MediaPlaylistBundle {
    fn new(url: Url) -> Self {
        Self {
            url,
            snapshot: None,
            last_snapshot_load_at: Duration::ZERO,
            last_snapshot_change_at: Duration::ZERO,
            earliest_next_load_at: Duration::ZERO,
            exclude_until: Duration::ZERO,
            active_for_playback: false,
            in_flight: None,
            pending: None,
            error: None,
            error_count: 0,
        }
    }

    fn is_snapshot_valid(&self, now: Duration, config: &TrackerConfig) -> bool {
        let Some(snapshot) = &self.snapshot else {
            return false;
        };
        let validity = Duration::from_millis(config.snapshot_validity_floor_ms)
            .max(Duration::from_micros(snapshot.duration_us));
        snapshot.has_end_tag
            || matches!(snapshot.playlist_type, Some(PlaylistType::Event | PlaylistType::Vod))
            || self.last_snapshot_load_at + validity > now
    }

    /// Reload URL carrying the blocking and delta update directives of the current snapshot.
    fn reload_url(&self) -> Url {
        let Some(snapshot) = &self.snapshot else {
            return self.url.clone();
        };
        let control = &snapshot.server_control;
        if control.skip_until_us.is_none() && !control.can_block_reload {
            return self.url.clone();
        }
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            if control.can_block_reload {
                query.append_pair(BLOCK_MSN_PARAM, &snapshot.next_media_sequence().to_string());
                if snapshot.part_target_duration_us.is_some() {
                    let mut part_index = snapshot.trailing_parts.len();
                    if snapshot.trailing_parts.last().is_some_and(|p| p.is_preload) {
                        part_index -= 1;
                    }
                    query.append_pair(BLOCK_PART_PARAM, &part_index.to_string());
                }
            }
            if control.skip_until_us.is_some() {
                query.append_pair(SKIP_PARAM, if control.can_skip_date_ranges { "v2" } else { "YES" });
            }
        }
        url
    }

    /// Queues a load of `url`, unless one is already queued or running.
    fn load(&mut self, url: Url) {
        self.exclude_until = Duration::ZERO;
        if self.in_flight.is_some() || self.pending.is_some() {
            return;
        }
        self.pending = Some(url);
    }

    fn load_playlist(&mut self, allow_delta_updates: bool) {
        let url = if allow_delta_updates {
            self.reload_url()
        } else {
            self.url.clone()
        };
        self.load(url);
    }
}

/// Tracks the playlists of one HLS presentation.
///
/// The first variant of the multivariant playlist starts out as primary. The
/// primary playlist, and any playlist marked active for playback, is refreshed
/// for as long as it has no end tag.
pub struct HlsPlaylistTracker {
    config: TrackerConfig,
    clock: SharedClock,

    initial_url: Url,
    multivariant: Option<Arc<MultivariantPlaylist>>,
    multivariant_in_flight: Option<InFlight>,
    multivariant_next_load_at: Option<Duration>,
    multivariant_error_count: u32,
    fatal_error: Option<IoriError>,

    bundles: Vec<MediaPlaylistBundle>,
    primary_url: Option<Url>,
    primary_snapshot: Option<Arc<MediaPlaylist>>,
    is_live: bool,
    initial_start_time_us: TimeUs,
    window: Option<LiveWindow>,

    events: Vec<TrackerEvent>,
}

impl HlsPlaylistTracker {
    pub fn new(url: Url, config: TrackerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            initial_url: url,
            multivariant: None,
            multivariant_in_flight: None,
            multivariant_next_load_at: Some(Duration::ZERO),
            multivariant_error_count: 0,
            fatal_error: None,
            bundles: Vec::new(),
            primary_url: None,
            primary_snapshot: None,
            is_live: false,
            initial_start_time_us: 0,
            window: None,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> ResourceState<MediaPlaylist> {
        if self.fatal_error.is_some() {
            return ResourceState::FatalError;
        }
        match &self.primary_snapshot {
            Some(snapshot) if snapshot.is_dynamic() => ResourceState::Live(snapshot.clone()),
            Some(snapshot) => ResourceState::Static(snapshot.clone()),
            None if self.multivariant_in_flight.is_some() || !self.bundles.is_empty() => {
                ResourceState::Loading
            }
            None => ResourceState::Idle,
        }
    }

    pub fn fatal_error(&self) -> Option<&IoriError> {
        self.fatal_error.as_ref()
    }

    pub fn multivariant_playlist(&self) -> Option<&Arc<MultivariantPlaylist>> {
        self.multivariant.as_ref()
    }

    pub fn primary_playlist_url(&self) -> Option<&Url> {
        self.primary_url.as_ref()
    }

    pub fn primary_snapshot(&self) -> Option<&Arc<MediaPlaylist>> {
        self.primary_snapshot.as_ref()
    }

    pub fn live_window(&self) -> Option<&LiveWindow> {
        self.window.as_ref()
    }

    /// Last error of a playlist, cleared when it gets a new snapshot.
    pub fn playlist_error(&self, url: &Url) -> Option<&IoriError> {
        self.bundle(url)?.error.as_ref()
    }

    pub fn poll_events(&mut self) -> Vec<TrackerEvent> {
        std::mem::take(&mut self.events)
    }

    fn bundle(&self, url: &Url) -> Option<&MediaPlaylistBundle> {
        self.bundles.iter().find(|b| &b.url == url)
    }

    fn bundle_mut(&mut self, url: &Url) -> Option<&mut MediaPlaylistBundle> {
        self.bundles.iter_mut().find(|b| &b.url == url)
    }

    fn is_variant_url(&self, url: &Url) -> bool {
        self.multivariant
            .as_ref()
            .is_some_and(|m| m.variants.iter().any(|v| &v.url == url))
    }

    /// Loads that should start now.
    pub fn poll_loads(&mut self) -> Vec<LoadRequest> {
        if self.fatal_error.is_some() {
            return Vec::new();
        }
        let now = self.clock.monotonic();
        let mut loads = Vec::new();

        if self.multivariant_in_flight.is_none() && self.multivariant_next_load_at.is_some_and(|at| at <= now) {
            self.multivariant_next_load_at = None;
            let request = LoadRequest::new(self.initial_url.clone(), LoadKind::Manifest);
            tracing::debug!(url = %request.url, "Loading playlist");
            self.multivariant_in_flight = Some(InFlight {
                id: request.id,
                url: request.url.clone(),
                started_at: now,
            });
            loads.push(request);
        }

        for bundle in &mut self.bundles {
            if bundle.in_flight.is_some() || bundle.earliest_next_load_at > now {
                continue;
            }
            let Some(url) = bundle.pending.take() else {
                continue;
            };
            tracing::debug!(url = %url, "Loading media playlist");
            let request = LoadRequest::new(url, LoadKind::Playlist);
            bundle.in_flight = Some(InFlight {
                id: request.id,
                url: request.url.clone(),
                started_at: now,
            });
            loads.push(request);
        }
        loads
    }

    /// When [`Self::poll_loads`] should be called again.
    pub fn next_deadline(&self) -> Option<Duration> {
        if self.fatal_error.is_some() {
            return None;
        }
        let multivariant = self
            .multivariant_next_load_at
            .filter(|_| self.multivariant_in_flight.is_none());
        self.bundles
            .iter()
            .filter(|b| b.in_flight.is_none() && b.pending.is_some())
            .map(|b| b.earliest_next_load_at)
            .chain(multivariant)
            .min()
    }

    pub fn on_load_completed(&mut self, id: LoadId, response: Response) {
        if self.multivariant_in_flight.as_ref().is_some_and(|f| f.id == id) {
            if let Some(in_flight) = self.multivariant_in_flight.take() {
                self.on_multivariant_loaded(&in_flight, response);
            }
            return;
        }
        let Some(index) = self.bundle_index_for(id) else {
            tracing::debug!(id = %id, "Discarding stale load result");
            return;
        };
        let Some(in_flight) = self.bundles[index].in_flight.take() else {
            return;
        };
        let text = String::from_utf8_lossy(&response.body);
        let parsed = parse_media_playlist(
            &text,
            &self.bundles[index].url,
            ParseContext {
                multivariant: self.multivariant.as_deref(),
                previous: self.bundles[index].snapshot.as_deref(),
            },
        );
        match parsed {
            Ok(playlist) => {
                self.bundles[index].error_count = 0;
                self.process_loaded_playlist(index, playlist, &in_flight);
            }
            Err(e) => self.on_playlist_load_error(index, &in_flight, e),
        }
    }

    pub fn on_load_error(&mut self, id: LoadId, error: IoriError) {
        if self.multivariant_in_flight.as_ref().is_some_and(|f| f.id == id) {
            self.multivariant_in_flight = None;
            self.on_multivariant_error(error);
            return;
        }
        let Some(index) = self.bundle_index_for(id) else {
            tracing::debug!(id = %id, "Discarding stale load error");
            return;
        };
        if let Some(in_flight) = self.bundles[index].in_flight.take() {
            self.on_playlist_load_error(index, &in_flight, error);
        }
    }

    /// Forgets the in-flight load of a playlist, returning its id so the owner can abort it.
    pub fn cancel(&mut self, url: &Url) -> Option<LoadId> {
        self.bundle_mut(url)?.in_flight.take().map(|f| f.id)
    }

    fn bundle_index_for(&self, id: LoadId) -> Option<usize> {
        self.bundles
            .iter()
            .position(|b| b.in_flight.as_ref().is_some_and(|f| f.id == id))
    }

    fn on_multivariant_loaded(&mut self, in_flight: &InFlight, response: Response) {
        let text = String::from_utf8_lossy(&response.body);
        let playlist = match parse_playlist(&text, &response.url, ParseContext::default()) {
            Ok(playlist) => playlist,
            Err(e) => return self.on_multivariant_error(e),
        };
        self.multivariant_error_count = 0;

        let (multivariant, media) = match playlist {
            Playlist::Multivariant(multivariant) => (multivariant, None),
            Playlist::Media(media) => (MultivariantPlaylist::single_variant(response.url.clone()), Some(media)),
        };
        let Some(primary_url) = multivariant.variants.first().map(|v| v.url.clone()) else {
            self.fatal_error = Some(IoriError::parse(0, "multivariant playlist has no variant"));
            return;
        };
        tracing::info!(
            variants = multivariant.variants.len(),
            renditions = multivariant.renditions.len(),
            "Loaded playlist"
        );

        self.bundles = multivariant
            .media_playlist_urls()
            .into_iter()
            .map(MediaPlaylistBundle::new)
            .collect();
        self.multivariant = Some(Arc::new(multivariant));
        self.primary_url = Some(primary_url.clone());

        let Some(index) = self.bundles.iter().position(|b| b.url == primary_url) else {
            return;
        };
        match media {
            Some(media) => self.process_loaded_playlist(index, media, in_flight),
            None => self.bundles[index].load_playlist(false),
        }
    }

    fn on_multivariant_error(&mut self, error: IoriError) {
        self.multivariant_error_count += 1;
        if error.is_recoverable() && self.multivariant_error_count <= self.config.min_retry_count {
            let delay = self.config.stale_retry_delay(self.multivariant_error_count);
            tracing::warn!(url = %self.initial_url, error = %error, "Failed to load playlist, retrying in {delay:?}");
            self.multivariant_next_load_at = Some(self.clock.monotonic() + delay);
        } else {
            tracing::error!(url = %self.initial_url, error = %error, "Failed to load playlist");
            self.fatal_error = Some(error);
        }
    }

    fn on_playlist_load_error(&mut self, index: usize, in_flight: &InFlight, error: IoriError) {
        let now = self.clock.monotonic();
        let bundle = &mut self.bundles[index];

        let delta_update_failed = matches!(error, IoriError::DeltaUpdateFailed { .. });
        let blocking_rejected = in_flight.is_blocking()
            && error
                .status()
                .is_some_and(|s| s.as_u16() == 400 || s.as_u16() == 503);
        if delta_update_failed || blocking_rejected {
            tracing::debug!(url = %bundle.url, error = %error, "Falling back to a full playlist reload");
            bundle.earliest_next_load_at = now;
            bundle.load_playlist(false);
            return;
        }

        bundle.error_count += 1;
        let url = bundle.url.clone();
        if error.is_recoverable() && bundle.error_count <= self.config.min_retry_count {
            let delay = self.config.stale_retry_delay(bundle.error_count);
            tracing::warn!(url = %url, error = %error, "Failed to load media playlist, retrying in {delay:?}");
            bundle.earliest_next_load_at = now + delay;
            bundle.load(in_flight.url.clone());
        } else {
            tracing::error!(url = %url, error = %error, "Failed to load media playlist");
        }
        bundle.error = Some(error);
        self.events.push(TrackerEvent::PlaylistError { url });
    }

    fn process_loaded_playlist(&mut self, index: usize, loaded: MediaPlaylist, in_flight: &InFlight) {
        let now = self.clock.monotonic();
        let old = self.bundles[index].snapshot.clone();
        let loaded_next_media_sequence = loaded.next_media_sequence();
        let snapshot = self.latest_snapshot(old.as_ref(), loaded);
        let changed = !old.as_ref().is_some_and(|old| Arc::ptr_eq(old, &snapshot));

        let bundle = &mut self.bundles[index];
        bundle.last_snapshot_load_at = now;
        bundle.snapshot = Some(snapshot.clone());
        let url = bundle.url.clone();

        if changed {
            bundle.error = None;
            bundle.last_snapshot_change_at = now;
            self.on_playlist_updated(&url, snapshot.clone());
        } else if !snapshot.has_end_tag {
            let stuck_after = us_to_duration(snapshot.target_duration_us as TimeUs)
                .mul_f64(self.config.playlist_stuck_coefficient);
            let error = if loaded_next_media_sequence < snapshot.media_sequence {
                Some(IoriError::PlaylistReset(url.clone()))
            } else if now.saturating_sub(self.bundles[index].last_snapshot_change_at) > stuck_after {
                Some(IoriError::PlaylistStuck(url.clone()))
            } else {
                None
            };
            if let Some(error) = error {
                tracing::warn!(url = %url, error = %error, "Playlist did not advance");
                self.bundles[index].error = Some(error);
                self.events.push(TrackerEvent::PlaylistError { url: url.clone() });
            }
        }

        let delay_us = if snapshot.server_control.can_block_reload {
            0
        } else if changed {
            snapshot.target_duration_us
        } else {
            snapshot.target_duration_us / 2
        };
        let load_duration = now.saturating_sub(in_flight.started_at);
        let is_primary = self.primary_url.as_ref() == Some(&url);
        let bundle = &mut self.bundles[index];
        bundle.earliest_next_load_at = (now + Duration::from_micros(delay_us)).saturating_sub(load_duration);
        if !snapshot.has_end_tag && (is_primary || bundle.active_for_playback) {
            bundle.load_playlist(true);
        }
    }

    /// Merges a loaded playlist with the previous snapshot of the same playlist.
    ///
    /// Returns `old` itself when the loaded playlist brings nothing new.
    fn latest_snapshot(&self, old: Option<&Arc<MediaPlaylist>>, loaded: MediaPlaylist) -> Arc<MediaPlaylist> {
        if let Some(old) = old {
            if !loaded.is_newer_than(Some(old)) {
                return if loaded.has_end_tag && !old.has_end_tag {
                    Arc::new(old.copy_with_end_tag())
                } else {
                    old.clone()
                };
            }
        }
        let old = old.map(Arc::as_ref);
        let start_time_us = self.loaded_start_time_us(old, &loaded);
        let discontinuity_sequence = self.loaded_discontinuity_sequence(old, &loaded);
        Arc::new(loaded.copy_with(start_time_us, discontinuity_sequence))
    }

    fn first_old_overlapping_segment<'a>(old: &'a MediaPlaylist, loaded: &MediaPlaylist) -> Option<&'a Segment> {
        let offset = loaded.media_sequence.checked_sub(old.media_sequence)?;
        old.segments.get(offset as usize)
    }

    fn loaded_start_time_us(&self, old: Option<&MediaPlaylist>, loaded: &MediaPlaylist) -> TimeUs {
        if loaded.has_program_date_time {
            return loaded.start_time_us;
        }
        let primary_start_us = self.primary_snapshot.as_ref().map_or(0, |s| s.start_time_us);
        let Some(old) = old else {
            return primary_start_us;
        };
        if let Some(segment) = Self::first_old_overlapping_segment(old, loaded) {
            return old.start_time_us + segment.base.relative_start_time_us;
        }
        if loaded.media_sequence.checked_sub(old.media_sequence) == Some(old.segments.len() as u64) {
            return old.end_time_us();
        }
        primary_start_us
    }

    fn loaded_discontinuity_sequence(&self, old: Option<&MediaPlaylist>, loaded: &MediaPlaylist) -> u32 {
        if loaded.has_discontinuity_sequence {
            return loaded.discontinuity_sequence;
        }
        let primary = self.primary_snapshot.as_ref().map_or(0, |s| s.discontinuity_sequence);
        let Some(old) = old else {
            return primary;
        };
        match (
            Self::first_old_overlapping_segment(old, loaded),
            loaded.segments.first(),
        ) {
            (Some(overlapping), Some(first)) => (old.discontinuity_sequence
                + overlapping.base.relative_discontinuity_sequence)
                .saturating_sub(first.base.relative_discontinuity_sequence),
            _ => primary,
        }
    }

    fn on_playlist_updated(&mut self, url: &Url, snapshot: Arc<MediaPlaylist>) {
        if self.primary_url.as_ref() == Some(url) {
            if self.primary_snapshot.is_none() {
                self.is_live = !snapshot.has_end_tag;
                self.initial_start_time_us = snapshot.start_time_us;
            }
            self.primary_snapshot = Some(snapshot);
            self.update_window();
            self.events.push(TrackerEvent::PrimaryPlaylistRefreshed);
        }
        self.events.push(TrackerEvent::PlaylistChanged(url.clone()));
    }

    fn update_window(&mut self) {
        let Some(snapshot) = &self.primary_snapshot else {
            return;
        };
        let now_unix_us = self.clock.wall_clock().timestamp_micros();
        let window = hls_live_window(
            snapshot,
            self.initial_start_time_us,
            self.is_live,
            now_unix_us,
            &self.config,
        );
        tracing::debug!(
            start_us = window.start_us,
            duration_us = window.duration_us,
            default_start_us = window.default_start_position_us,
            "Live window updated"
        );
        self.window = Some(window);
    }

    /// Request URL for a playlist about to become primary, blocking until it catches up
    /// with what the current primary reported about it.
    fn request_url_for_primary_change(&self, url: &Url) -> Url {
        let report = self
            .primary_snapshot
            .as_ref()
            .filter(|s| s.server_control.can_block_reload)
            .and_then(|s| s.rendition_reports.get(url));
        let Some(report) = report else {
            return url.clone();
        };
        let mut url = url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(BLOCK_MSN_PARAM, &report.last_media_sequence.to_string());
            if let Some(part) = report.last_part_index {
                query.append_pair(BLOCK_PART_PARAM, &part.to_string());
            }
        }
        url
    }

    /// Whether a snapshot already covers what the current primary reports about it.
    fn is_caught_up(&self, url: &Url, snapshot: &MediaPlaylist) -> bool {
        let Some(report) = self
            .primary_snapshot
            .as_ref()
            .and_then(|s| s.rendition_reports.get(url))
        else {
            return false;
        };
        let next = snapshot.next_media_sequence();
        match report.last_part_index {
            Some(part) => {
                next > report.last_media_sequence
                    || (next == report.last_media_sequence && snapshot.trailing_parts.len() > part)
            }
            None => next > report.last_media_sequence,
        }
    }

    fn maybe_set_primary_url(&mut self, url: &Url) {
        if self.primary_url.as_ref() == Some(url)
            || !self.is_variant_url(url)
            || self.primary_snapshot.as_ref().is_some_and(|s| s.has_end_tag)
        {
            return;
        }
        tracing::info!(url = %url, "Switching primary playlist");
        self.primary_url = Some(url.clone());

        let new_snapshot = self.bundle(url).and_then(|b| b.snapshot.clone());
        match new_snapshot {
            Some(snapshot) if snapshot.has_end_tag || self.is_caught_up(url, &snapshot) => {
                self.primary_snapshot = Some(snapshot.clone());
                self.update_window();
                self.events.push(TrackerEvent::PrimaryPlaylistRefreshed);
                if !snapshot.has_end_tag {
                    if let Some(bundle) = self.bundle_mut(url) {
                        bundle.load_playlist(true);
                    }
                }
            }
            _ => {
                let request_url = self.request_url_for_primary_change(url);
                if let Some(bundle) = self.bundle_mut(url) {
                    bundle.load(request_url);
                }
            }
        }
    }

    /// Makes the first variant that is not excluded the primary one.
    fn maybe_select_new_primary(&mut self) -> bool {
        let now = self.clock.monotonic();
        let Some(multivariant) = self.multivariant.clone() else {
            return false;
        };
        for variant in &multivariant.variants {
            let Some(bundle) = self.bundle(&variant.url) else {
                continue;
            };
            if now >= bundle.exclude_until {
                let request_url = self.request_url_for_primary_change(&variant.url);
                self.primary_url = Some(variant.url.clone());
                if let Some(bundle) = self.bundle_mut(&variant.url) {
                    bundle.load(request_url);
                }
                return true;
            }
        }
        false
    }
}

impl PlaylistProvider for HlsPlaylistTracker {
    fn is_snapshot_valid(&self, url: &Url) -> bool {
        let now = self.clock.monotonic();
        self.bundle(url).is_some_and(|b| b.is_snapshot_valid(now, &self.config))
    }

    fn playlist_snapshot(&mut self, url: &Url, for_playback: bool) -> Option<Arc<MediaPlaylist>> {
        let snapshot = self.bundle(url)?.snapshot.clone();
        if snapshot.is_some() && for_playback {
            self.maybe_set_primary_url(url);
            if let Some(bundle) = self.bundle_mut(url) {
                bundle.active_for_playback = true;
            }
        }
        snapshot
    }

    fn initial_start_time_us(&self) -> TimeUs {
        self.initial_start_time_us
    }

    fn is_live(&self) -> bool {
        self.is_live
    }

    fn refresh_playlist(&mut self, url: &Url) {
        if let Some(bundle) = self.bundle_mut(url) {
            bundle.load_playlist(true);
        }
    }

    fn deactivate_playlist_for_playback(&mut self, url: &Url) {
        if let Some(bundle) = self.bundle_mut(url) {
            bundle.active_for_playback = false;
        }
    }

    fn exclude_media_playlist(&mut self, url: &Url, exclusion: Duration) -> bool {
        let now = self.clock.monotonic();
        let Some(bundle) = self.bundle_mut(url) else {
            return false;
        };
        bundle.exclude_until = now + exclusion;
        let is_primary = self.primary_url.as_ref() == Some(url);
        !(is_primary && !self.maybe_select_new_primary())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::time::ManualClock;

    const MULTIVARIANT: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000
low.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2000000
high.m3u8
";

    fn media(msn: u64, count: u64, end: bool) -> String {
        let mut text = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:{msn}\n"
        );
        for i in msn..msn + count {
            text.push_str(&format!("#EXTINF:4.0,\nseg{i}.ts\n"));
        }
        if end {
            text.push_str("#EXT-X-ENDLIST\n");
        }
        text
    }

    fn setup() -> (Arc<ManualClock>, HlsPlaylistTracker) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let url = Url::parse("https://example.com/master.m3u8").unwrap();
        (clock.clone(), HlsPlaylistTracker::new(url, TrackerConfig::default(), clock))
    }

    fn respond(tracker: &mut HlsPlaylistTracker, request: &LoadRequest, body: &str) {
        tracker.on_load_completed(
            request.id,
            Response {
                url: request.url.clone(),
                body: Bytes::from(body.to_string()),
                date: None,
            },
        );
    }

    fn url(path: &str) -> Url {
        Url::parse("https://example.com/").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_multivariant_then_primary() {
        let (_clock, mut tracker) = setup();
        let loads = tracker.poll_loads();
        assert_eq!(loads.len(), 1);
        respond(&mut tracker, &loads[0], MULTIVARIANT);
        assert_eq!(tracker.primary_playlist_url(), Some(&url("low.m3u8")));

        let loads = tracker.poll_loads();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].url, url("low.m3u8"));
        respond(&mut tracker, &loads[0], &media(10, 3, false));

        assert!(matches!(tracker.state(), ResourceState::Live(_)));
        assert!(tracker.is_live());
        assert!(tracker.is_snapshot_valid(&url("low.m3u8")));
        assert!(!tracker.is_snapshot_valid(&url("high.m3u8")));
        assert_eq!(
            tracker.poll_events(),
            vec![
                TrackerEvent::PrimaryPlaylistRefreshed,
                TrackerEvent::PlaylistChanged(url("low.m3u8"))
            ]
        );

        // the next refresh waits one target duration
        assert!(tracker.poll_loads().is_empty());
        assert_eq!(tracker.next_deadline(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_media_playlist_as_initial() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut tracker = HlsPlaylistTracker::new(url("vod.m3u8"), TrackerConfig::default(), clock);
        let loads = tracker.poll_loads();
        respond(&mut tracker, &loads[0], &media(0, 5, true));

        assert!(matches!(tracker.state(), ResourceState::Static(_)));
        assert!(!tracker.is_live());
        assert_eq!(tracker.multivariant_playlist().unwrap().variants.len(), 1);
        assert!(tracker.poll_loads().is_empty());
        assert_eq!(tracker.next_deadline(), None);
    }

    #[test]
    fn test_unchanged_playlist_gets_stuck() {
        let (clock, mut tracker) = setup();
        let loads = tracker.poll_loads();
        respond(&mut tracker, &loads[0], MULTIVARIANT);
        let loads = tracker.poll_loads();
        respond(&mut tracker, &loads[0], &media(10, 3, false));
        tracker.poll_events();

        // 3.5 target durations is 14s, unchanged reloads come every 2s
        let mut elapsed = Duration::from_secs(4);
        clock.advance(Duration::from_secs(4));
        while elapsed <= Duration::from_secs(14) {
            let loads = tracker.poll_loads();
            assert_eq!(loads.len(), 1);
            respond(&mut tracker, &loads[0], &media(10, 3, false));
            assert!(tracker.playlist_error(&url("low.m3u8")).is_none());
            clock.advance(Duration::from_secs(2));
            elapsed += Duration::from_secs(2);
        }
        let loads = tracker.poll_loads();
        respond(&mut tracker, &loads[0], &media(10, 3, false));
        assert!(matches!(
            tracker.playlist_error(&url("low.m3u8")),
            Some(IoriError::PlaylistStuck(_))
        ));
        assert_eq!(
            tracker.poll_events(),
            vec![TrackerEvent::PlaylistError { url: url("low.m3u8") }]
        );
    }

    #[test]
    fn test_playlist_reset() {
        let (clock, mut tracker) = setup();
        let loads = tracker.poll_loads();
        respond(&mut tracker, &loads[0], MULTIVARIANT);
        let loads = tracker.poll_loads();
        respond(&mut tracker, &loads[0], &media(10, 3, false));

        clock.advance(Duration::from_secs(4));
        let loads = tracker.poll_loads();
        respond(&mut tracker, &loads[0], &media(2, 3, false));
        assert!(matches!(
            tracker.playlist_error(&url("low.m3u8")),
            Some(IoriError::PlaylistReset(_))
        ));
        // the old snapshot is kept
        assert_eq!(tracker.primary_snapshot().unwrap().media_sequence, 10);
    }

    #[test]
    fn test_exclusion_moves_primary() {
        let (_clock, mut tracker) = setup();
        let loads = tracker.poll_loads();
        respond(&mut tracker, &loads[0], MULTIVARIANT);

        assert!(tracker.exclude_media_playlist(&url("low.m3u8"), Duration::from_secs(60)));
        assert_eq!(tracker.primary_playlist_url(), Some(&url("high.m3u8")));
        assert!(!tracker.exclude_media_playlist(&url("high.m3u8"), Duration::from_secs(60)));
    }

    #[test]
    fn test_stale_completion_discarded() {
        let (_clock, mut tracker) = setup();
        let loads = tracker.poll_loads();
        respond(&mut tracker, &loads[0], MULTIVARIANT);
        let loads = tracker.poll_loads();
        let canceled = tracker.cancel(&url("low.m3u8"));
        assert_eq!(canceled, Some(loads[0].id));

        respond(&mut tracker, &loads[0], &media(10, 3, false));
        assert!(tracker.primary_snapshot().is_none());
    }

    #[test]
    fn test_blocking_reload_url() {
        let (_clock, mut tracker) = setup();
        let loads = tracker.poll_loads();
        respond(&mut tracker, &loads[0], MULTIVARIANT);
        let loads = tracker.poll_loads();
        respond(
            &mut tracker,
            &loads[0],
            "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-PART-INF:PART-TARGET=1.0
#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK=3.0,CAN-SKIP-UNTIL=24.0
#EXT-X-MEDIA-SEQUENCE:100
#EXTINF:4.0,
s100.ts
#EXT-X-PART:DURATION=1.0,URI=\"p101.0.ts\",INDEPENDENT=YES
#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"p101.1.ts\"
",
        );

        // blocking playlists are reloaded right away
        let loads = tracker.poll_loads();
        assert_eq!(loads.len(), 1);
        let query: Vec<(String, String)> = loads[0].url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("_HLS_msn".to_string(), "101".to_string()),
                ("_HLS_part".to_string(), "1".to_string()),
                ("_HLS_skip".to_string(), "YES".to_string()),
            ]
        );

        // a rejected blocking request falls back to a plain reload
        tracker.on_load_error(loads[0].id, IoriError::HttpError(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        let loads = tracker.poll_loads();
        assert_eq!(loads[0].url, url("low.m3u8"));
        assert!(tracker.playlist_error(&url("low.m3u8")).is_none());
    }
}
