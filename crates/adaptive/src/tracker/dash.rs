use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use url::Url;

use super::{
    window::{dash_live_window, dash_min_update_period, dash_refresh_interval, window_changes_implicitly},
    LiveWindow, LoadId, LoadKind, LoadRequest, PlaylistProvider, ResourceState,
};
use crate::{
    config::TrackerConfig,
    dash::{parse_mpd, select_timing_source, ClockOffset, DashManifest, TimingSource},
    error::{IoriError, IoriResult},
    fetch::Response,
    model::MediaPlaylist,
    time::{SharedClock, TimeUs},
};

struct InFlight {
    id: LoadId,
    kind: LoadKind,
    requested_url: Url,
    started_at: Duration,
    started_wall: DateTime<Utc>,
}

/// Tracks one DASH presentation.
///
/// Each representation of the current manifest is exposed as a media playlist
/// under [`DashManifestTracker::track_url`].
pub struct DashManifestTracker {
    config: TrackerConfig,
    clock: SharedClock,

    /// Stable identity of the presentation, used to key track snapshots.
    track_base: Url,
    /// Where the next manifest refresh is fetched from.
    target_url: Url,

    manifest: Option<Arc<DashManifest>>,
    /// A dynamic manifest waiting for clock synchronization before being processed.
    pending_manifest: Option<Arc<DashManifest>>,
    pending_timing: Option<TimingSource>,
    clock_offset: ClockOffset,
    snapshots: HashMap<Url, Arc<MediaPlaylist>>,
    window: Option<LiveWindow>,

    in_flight: Option<InFlight>,
    started: bool,
    manifest_load_started_at: Duration,
    next_refresh_at: Option<Duration>,
    next_timeline_refresh_at: Option<Duration>,

    stale_attempts: u32,
    error_count: u32,
    expired_publish_time: Option<DateTime<Utc>>,
    fatal_error: Option<IoriError>,
}

impl DashManifestTracker {
    pub fn new(url: Url, config: TrackerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            track_base: url.clone(),
            target_url: url,
            manifest: None,
            pending_manifest: None,
            pending_timing: None,
            clock_offset: ClockOffset::zero(),
            snapshots: HashMap::new(),
            window: None,
            in_flight: None,
            started: false,
            manifest_load_started_at: Duration::ZERO,
            next_refresh_at: None,
            next_timeline_refresh_at: None,
            stale_attempts: 0,
            error_count: 0,
            expired_publish_time: None,
            fatal_error: None,
        }
    }

    /// Tracks an already known static manifest without loading anything.
    pub fn sideloaded(
        manifest: DashManifest,
        url: Url,
        config: TrackerConfig,
        clock: SharedClock,
    ) -> IoriResult<Self> {
        if manifest.dynamic {
            return Err(IoriError::UnsupportedSideload);
        }
        let mut tracker = Self::new(url, config, clock);
        tracker.started = true;
        tracker.manifest = Some(Arc::new(manifest));
        tracker.process_manifest();
        Ok(tracker)
    }

    pub fn state(&self) -> ResourceState<DashManifest> {
        if self.fatal_error.is_some() {
            return ResourceState::FatalError;
        }
        match &self.manifest {
            Some(manifest) if manifest.dynamic => ResourceState::Live(manifest.clone()),
            Some(manifest) => ResourceState::Static(manifest.clone()),
            None if self.in_flight.is_some() || self.pending_manifest.is_some() => ResourceState::Loading,
            None => ResourceState::Idle,
        }
    }

    /// The error that moved the tracker into [`ResourceState::FatalError`].
    pub fn fatal_error(&self) -> Option<&IoriError> {
        self.fatal_error.as_ref()
    }

    pub fn manifest(&self) -> Option<&Arc<DashManifest>> {
        self.manifest.as_ref()
    }

    pub fn manifest_url(&self) -> &Url {
        &self.target_url
    }

    pub fn live_window(&self) -> Option<&LiveWindow> {
        self.window.as_ref()
    }

    pub fn clock_offset(&self) -> ClockOffset {
        self.clock_offset
    }

    /// Key of a representation's snapshot.
    pub fn track_url(&self, period_index: usize, representation_id: &str) -> Option<Url> {
        let period = self.manifest.as_ref()?.periods.get(period_index)?;
        Some(DashManifest::track_url(&self.track_base, period, representation_id))
    }

    /// Replaces the URL subsequent refreshes are loaded from.
    ///
    /// A load in flight keeps going, but a `Location` or redirect it reports no longer
    /// replaces this URL.
    pub fn replace_manifest_url(&mut self, url: Url) {
        tracing::info!(url = %url, "Manifest url replaced");
        self.target_url = url;
    }

    /// Marks every manifest published at or before `publish_time` as stale.
    pub fn on_publish_time_expired(&mut self, publish_time: DateTime<Utc>) {
        if self.expired_publish_time.map_or(true, |t| t < publish_time) {
            self.expired_publish_time = Some(publish_time);
        }
    }

    /// Requests an immediate refresh of a dynamic manifest.
    pub fn refresh_manifest(&mut self) {
        if self.manifest.as_ref().is_some_and(|m| m.dynamic) {
            self.next_refresh_at = Some(self.clock.monotonic());
        }
    }

    fn now_unix_us(&self) -> TimeUs {
        self.clock_offset.now_unix_us(self.clock.wall_clock())
    }

    fn request(&mut self, url: Url, kind: LoadKind) -> LoadRequest {
        let request = LoadRequest::new(url, kind);
        self.in_flight = Some(InFlight {
            id: request.id,
            kind,
            requested_url: request.url.clone(),
            started_at: self.clock.monotonic(),
            started_wall: self.clock.wall_clock(),
        });
        request
    }

    /// Loads that should start now.
    pub fn poll_loads(&mut self) -> Vec<LoadRequest> {
        if self.fatal_error.is_some() || self.in_flight.is_some() {
            return Vec::new();
        }
        let now = self.clock.monotonic();

        if self.next_timeline_refresh_at.is_some_and(|at| at <= now) {
            self.next_timeline_refresh_at = None;
            self.process_manifest();
        }

        if let Some(source) = &self.pending_timing {
            if let Some(url) = source.url().cloned() {
                return vec![self.request(url, LoadKind::TimingSync)];
            }
        }

        if !self.started || self.next_refresh_at.is_some_and(|at| at <= now) {
            self.started = true;
            self.next_refresh_at = None;
            let url = self.target_url.clone();
            tracing::debug!(url = %url, "Loading manifest");
            return vec![self.request(url, LoadKind::Manifest)];
        }
        Vec::new()
    }

    /// When [`Self::poll_loads`] should be called again.
    pub fn next_deadline(&self) -> Option<Duration> {
        if self.fatal_error.is_some() {
            return None;
        }
        let network = self.next_refresh_at.filter(|_| self.in_flight.is_none());
        match (network, self.next_timeline_refresh_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Takes the in-flight load if `id` matches it.
    fn take_in_flight(&mut self, id: LoadId) -> Option<InFlight> {
        if self.in_flight.as_ref().is_some_and(|f| f.id == id) {
            self.in_flight.take()
        } else {
            tracing::debug!(id = %id, "Discarding stale load result");
            None
        }
    }

    pub fn on_load_completed(&mut self, id: LoadId, response: Response) {
        let Some(in_flight) = self.take_in_flight(id) else {
            return;
        };
        match in_flight.kind {
            LoadKind::TimingSync => self.on_timing_loaded(&in_flight, Ok(response)),
            _ => {
                let text = String::from_utf8_lossy(&response.body);
                match parse_mpd(&text, &response.url) {
                    Ok(manifest) => self.on_manifest_loaded(in_flight, response.url, manifest),
                    Err(e) => self.on_manifest_error(e),
                }
            }
        }
    }

    pub fn on_load_error(&mut self, id: LoadId, error: IoriError) {
        let Some(in_flight) = self.take_in_flight(id) else {
            return;
        };
        match in_flight.kind {
            LoadKind::TimingSync => self.on_timing_loaded(&in_flight, Err(error)),
            _ => self.on_manifest_error(error),
        }
    }

    /// Forgets the in-flight load, returning its id so the owner can abort it.
    pub fn cancel(&mut self) -> Option<LoadId> {
        let in_flight = self.in_flight.take()?;
        if in_flight.kind == LoadKind::Manifest && self.manifest.is_none() {
            self.started = false;
        }
        if in_flight.kind == LoadKind::TimingSync {
            self.pending_timing = None;
            self.pending_manifest = None;
            self.started = false;
        }
        Some(in_flight.id)
    }

    fn on_manifest_error(&mut self, error: IoriError) {
        self.error_count += 1;
        if error.is_recoverable() && self.error_count <= self.config.min_retry_count {
            let delay = self.config.stale_retry_delay(self.error_count);
            tracing::warn!(url = %self.target_url, error = %error, attempt = self.error_count, "Failed to load manifest, retrying in {delay:?}");
            self.next_refresh_at = Some(self.clock.monotonic() + delay);
        } else {
            tracing::error!(url = %self.target_url, error = %error, "Failed to load manifest");
            self.fatal_error = Some(error);
        }
    }

    /// Whether a new dynamic manifest lost periods or was already declared obsolete.
    fn is_stale(&self, new: &DashManifest) -> bool {
        let Some(old) = &self.manifest else {
            return false;
        };
        let new_first_start = new.periods.first().map(|p| p.start_us).unwrap_or(0);
        let removed = old
            .periods
            .iter()
            .take_while(|p| p.start_us < new_first_start)
            .count();
        if old.period_count() - removed > new.period_count() {
            tracing::warn!(url = %self.target_url, "Loaded out of sync manifest");
            return true;
        }
        if let (Some(expired), Some(published)) = (self.expired_publish_time, new.publish_time) {
            if published <= expired {
                tracing::warn!(url = %self.target_url, %published, %expired, "Loaded stale dynamic manifest");
                return true;
            }
        }
        false
    }

    fn on_manifest_loaded(&mut self, in_flight: InFlight, final_url: Url, manifest: DashManifest) {
        if manifest.periods.is_empty() {
            return self.on_manifest_error(IoriError::parse(0, "manifest has no period"));
        }

        if manifest.dynamic && self.is_stale(&manifest) {
            self.stale_attempts += 1;
            if self.stale_attempts <= self.config.min_retry_count {
                self.next_refresh_at =
                    Some(self.clock.monotonic() + self.config.stale_retry_delay(self.stale_attempts));
            } else {
                self.fatal_error = Some(IoriError::StaleManifest {
                    attempts: self.stale_attempts,
                });
            }
            return;
        }
        self.stale_attempts = 0;
        self.error_count = 0;

        // A manual replacement during the load wins over whatever the server says.
        if in_flight.requested_url == self.target_url {
            self.target_url = manifest.location.clone().unwrap_or(final_url);
        }
        self.manifest_load_started_at = in_flight.started_at;

        let manifest = Arc::new(manifest);
        if self.manifest.is_none() && manifest.dynamic {
            match select_timing_source(&manifest.utc_timing, &manifest.base_url) {
                Some(TimingSource::Direct(remote)) => {
                    self.clock_offset =
                        ClockOffset::from_sample(remote, in_flight.started_wall, in_flight.started_wall);
                }
                Some(source) => {
                    self.pending_timing = Some(source);
                    self.pending_manifest = Some(manifest);
                    return;
                }
                None => self.clock_offset = ClockOffset::zero(),
            }
        }
        self.manifest = Some(manifest);
        self.process_manifest();
    }

    fn on_timing_loaded(&mut self, in_flight: &InFlight, result: IoriResult<Response>) {
        let Some(source) = self.pending_timing.take() else {
            return;
        };
        let remote = result.and_then(|response| source.remote_time(&response.body, response.date));
        match remote {
            Ok(remote) => {
                self.clock_offset =
                    ClockOffset::from_sample(remote, in_flight.started_wall, self.clock.wall_clock());
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to resolve server time, using local time.");
                self.clock_offset = ClockOffset::zero();
            }
        }
        if let Some(manifest) = self.pending_manifest.take() {
            self.manifest = Some(manifest);
            self.process_manifest();
        }
    }

    /// Recomputes the window and track snapshots, and schedules the next refresh.
    fn process_manifest(&mut self) {
        let Some(manifest) = self.manifest.clone() else {
            return;
        };
        let now_unix_us = self.now_unix_us();
        let window = dash_live_window(&manifest, now_unix_us, &self.config);
        tracing::debug!(
            start_us = window.start_us,
            duration_us = window.duration_us,
            default_start_us = window.default_start_position_us,
            "Live window updated"
        );
        self.window = Some(window);
        self.snapshots =
            manifest.materialize(&self.track_base, now_unix_us, self.config.max_live_segments);

        if let Some(period) = dash_min_update_period(&manifest, &self.config) {
            self.next_refresh_at = Some(self.manifest_load_started_at + period);
        }
        if window_changes_implicitly(&manifest) {
            let interval = dash_refresh_interval(&manifest, now_unix_us, &self.config);
            self.next_timeline_refresh_at = Some(self.clock.monotonic() + interval);
        }
    }
}

impl PlaylistProvider for DashManifestTracker {
    fn is_snapshot_valid(&self, url: &Url) -> bool {
        self.snapshots.contains_key(url)
    }

    fn playlist_snapshot(&mut self, url: &Url, _for_playback: bool) -> Option<Arc<MediaPlaylist>> {
        self.snapshots.get(url).cloned()
    }

    fn initial_start_time_us(&self) -> TimeUs {
        0
    }

    fn is_live(&self) -> bool {
        self.manifest.as_ref().is_some_and(|m| m.dynamic)
    }

    fn refresh_playlist(&mut self, _url: &Url) {
        self.refresh_manifest();
    }

    fn exclude_media_playlist(&mut self, _url: &Url, _exclusion: Duration) -> bool {
        // Representations share one manifest, exclusion is up to the track selection.
        true
    }
}
