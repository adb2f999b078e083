use std::time::Duration;

use iori_adaptive::{
    chunk::{
        AdaptiveTrackSelection, ChunkSource, LoadingInfo, MediaChunk, NextChunk, PublicationState,
        TrackSelection,
    },
    fetch::{HttpTransport, LoadEvent, LoadOutcome, Loader},
    time::{duration_to_us, ms_to_us, SharedClock, TimeUs},
    tracker::{LoadId, LoadKind, LoadRequest},
    IoriError,
};
use reqwest::Url;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{config::Config, tracker::Tracker};

/// Upper bound of how long the loop sleeps, so simulated playback keeps moving.
const TICK: Duration = Duration::from_millis(500);

fn seconds(us: TimeUs) -> f64 {
    us as f64 / 1_000_000.0
}

/// Playback position advancing at real time, stalling at the end of the buffer.
struct Playback {
    position_us: TimeUs,
    updated_at: Duration,
}

impl Playback {
    fn advance(&mut self, now: Duration, buffered_until_us: TimeUs) {
        let elapsed = duration_to_us(now.saturating_sub(self.updated_at));
        self.position_us = (self.position_us + elapsed).min(buffered_until_us.max(self.position_us));
        self.updated_at = now;
    }
}

pub struct Session {
    config: Config,
    clock: SharedClock,
    manifest_url: Url,
    allow_end_of_stream: bool,

    tracker: Tracker,
    loader: Loader<HttpTransport>,
    events: UnboundedReceiver<LoadEvent>,
    source: Option<ChunkSource<AdaptiveTrackSelection>>,

    /// Chunks loaded or loading, oldest first.
    queue: Vec<MediaChunk>,
    media_load: Option<LoadId>,
    key_load: Option<LoadId>,
    load_position_us: TimeUs,
    playback: Option<Playback>,
    ended: bool,
}

impl Session {
    pub fn new(
        manifest_url: Url,
        config: Config,
        clock: SharedClock,
        transport: HttpTransport,
        allow_end_of_stream: bool,
    ) -> Self {
        let tracker = Tracker::new(manifest_url.clone(), config.tracker.clone(), clock.clone());
        let (loader, events) = Loader::new(transport);
        Self {
            config,
            clock,
            manifest_url,
            allow_end_of_stream,
            tracker,
            loader,
            events,
            source: None,
            queue: Vec::new(),
            media_load: None,
            key_load: None,
            load_position_us: 0,
            playback: None,
            ended: false,
        }
    }

    pub async fn run(mut self, duration: Option<Duration>) -> anyhow::Result<()> {
        tracing::info!(url = %self.manifest_url, "Watching {} manifest", self.tracker.kind());
        let stop_at = duration.map(|d| self.clock.monotonic() + d);

        loop {
            self.start_tracker_loads();
            if let Some(e) = self.tracker.fatal_error() {
                anyhow::bail!("Manifest can not be tracked any more: {e}");
            }
            self.handle_playlist_errors();
            self.init_source()?;
            self.advance_playback();

            if self.ended {
                tracing::info!("End of stream reached");
                break;
            }
            let now = self.clock.monotonic();
            if stop_at.is_some_and(|at| now >= at) {
                break;
            }

            self.load_next_chunk()?;
            // a blocked chunk source asks the tracker for a refresh
            self.start_tracker_loads();

            let wake_in = self
                .tracker
                .next_deadline()
                .into_iter()
                .chain(stop_at)
                .min()
                .map_or(TICK, |at| at.saturating_sub(now).min(TICK));
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.on_load_event(event)?,
                    None => break,
                },
                _ = tokio::time::sleep(wake_in) => {}
            }
        }

        self.loader.cancel_all();
        if let Some(source) = &self.source {
            tracing::info!(
                estimate = source.selection().bandwidth_estimate(),
                "Stopped at {:.3}s",
                seconds(self.playback_position_us())
            );
        }
        Ok(())
    }

    fn start_tracker_loads(&mut self) {
        for request in self.tracker.poll_loads() {
            self.loader.start(request);
        }
    }

    fn playback_position_us(&self) -> TimeUs {
        self.playback
            .as_ref()
            .map_or(self.load_position_us, |p| p.position_us)
    }

    fn advance_playback(&mut self) {
        let now = self.clock.monotonic();
        let buffered_until_us = self.load_position_us;
        if let Some(playback) = &mut self.playback {
            playback.advance(now, buffered_until_us);
        }
        let position_us = self.playback_position_us();
        // the last chunk stays, it decides where loading continues
        let played = self
            .queue
            .iter()
            .take(self.queue.len().saturating_sub(1))
            .take_while(|c| c.load_completed && c.end_time_us <= position_us)
            .count();
        self.queue.drain(..played);
    }

    fn handle_playlist_errors(&mut self) {
        let exclusion = Duration::from_millis(self.config.playback.exclusion_ms);
        for url in self.tracker.failed_playlists() {
            let Some(source) = &mut self.source else {
                continue;
            };
            if !source.on_playlist_error(&mut self.tracker, &url, Some(exclusion)) {
                tracing::warn!(url = %url, "Playlist failed and can not be excluded");
            }
        }
    }

    fn init_source(&mut self) -> anyhow::Result<()> {
        if self.source.is_some() {
            return Ok(());
        }
        let Some(window) = self.tracker.live_window() else {
            return Ok(());
        };
        let start_us = window.default_start_us();
        let is_dynamic = window.is_dynamic;
        let Some(tracks) = self.tracker.tracks(&self.manifest_url) else {
            return Ok(());
        };

        for (index, track) in tracks.iter().enumerate() {
            let resolution = track
                .resolution
                .map(|r| format!("{}x{}", r.width, r.height))
                .unwrap_or_default();
            println!(
                "track #{index} {:>9}bps {resolution:>9} {} {}",
                track.bandwidth,
                track.codecs.as_deref().unwrap_or("-"),
                track.url
            );
        }
        let bandwidths = tracks.iter().map(|t| t.bandwidth).collect();
        let selection = AdaptiveTrackSelection::new(bandwidths, self.config.adaptive.clone());
        self.source = Some(ChunkSource::new(
            tracks,
            selection,
            self.config.chunk.clone(),
            self.clock.clone(),
        )?);
        self.load_position_us = start_us;
        println!(
            "start at {:.3}s ({})",
            seconds(start_us),
            if is_dynamic { "live" } else { "on demand" }
        );
        Ok(())
    }

    fn load_next_chunk(&mut self) -> anyhow::Result<()> {
        if self.media_load.is_some() || self.key_load.is_some() {
            return Ok(());
        }
        let Some(source) = &mut self.source else {
            return Ok(());
        };
        let playback_position_us = self
            .playback
            .as_ref()
            .map_or(self.load_position_us, |p| p.position_us);
        if self.load_position_us - playback_position_us >= ms_to_us(self.config.playback.buffer_ahead_ms) {
            return Ok(());
        }

        let next = source.get_next_chunk(
            &mut self.tracker,
            &LoadingInfo { playback_position_us },
            self.load_position_us,
            self.playback.as_ref().map(|p| p.position_us),
            &self.queue,
            self.allow_end_of_stream,
        );
        match next {
            Ok(NextChunk::Media(chunk)) => {
                println!(
                    "media #{} msn={}{} [{:.3}s, {:.3}s){}{} {}",
                    chunk.track_index,
                    chunk.media_sequence,
                    chunk.part_index.map(|p| format!(" part={p}")).unwrap_or_default(),
                    seconds(chunk.start_time_us),
                    seconds(chunk.end_time_us),
                    if chunk.is_preload { " preload" } else { "" },
                    if chunk.should_splice { " splice" } else { "" },
                    chunk.url
                );
                let request = LoadRequest {
                    byte_range: chunk.byte_range,
                    ..LoadRequest::new(chunk.url.clone(), LoadKind::Media)
                };
                self.media_load = Some(request.id);
                self.loader.start(request);
                self.queue.push(chunk);
            }
            Ok(NextChunk::Key(key)) => {
                println!("key   #{} {}", key.track_index, key.url);
                let request = LoadRequest::new(key.url, LoadKind::Key);
                self.key_load = Some(request.id);
                self.loader.start(request);
            }
            Ok(NextChunk::EndOfStream) => {
                println!("end of stream");
                self.ended = true;
            }
            Ok(NextChunk::BlockedOnPlaylist(url)) => {
                tracing::debug!(url = %url, "Waiting for playlist");
            }
            Ok(NextChunk::Deferred) => {
                tracing::debug!("Chunk deferred until the next playlist refresh");
            }
            Err(IoriError::BehindLiveWindow) => {
                let restart_us = self
                    .tracker
                    .live_window()
                    .map_or(self.load_position_us, |w| w.default_start_us());
                println!("behind live window, restarting at {:.3}s", seconds(restart_us));
                self.queue.clear();
                self.load_position_us = restart_us;
                self.playback = None;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn on_load_event(&mut self, event: LoadEvent) -> anyhow::Result<()> {
        match event.kind {
            LoadKind::Manifest | LoadKind::Playlist | LoadKind::TimingSync => match event.outcome {
                LoadOutcome::Completed(response) => self.tracker.on_load_completed(event.id, response),
                LoadOutcome::Failed(e) => self.tracker.on_load_error(event.id, e),
                LoadOutcome::Canceled => {}
            },
            LoadKind::Key => {
                if self.key_load != Some(event.id) {
                    return Ok(());
                }
                self.key_load = None;
                let Some(source) = &mut self.source else {
                    return Ok(());
                };
                match event.outcome {
                    LoadOutcome::Completed(response) => source.on_key_loaded(event.url, response.body),
                    LoadOutcome::Failed(e) => {
                        tracing::warn!(url = %event.url, "Failed to load key: {e}");
                        let exclusion = Duration::from_millis(self.config.playback.exclusion_ms);
                        exclude_selected_track(source, exclusion);
                    }
                    LoadOutcome::Canceled => {}
                }
            }
            LoadKind::Media => {
                if self.media_load != Some(event.id) {
                    return Ok(());
                }
                self.media_load = None;
                self.on_media_loaded(event)?;
            }
        }
        Ok(())
    }

    fn on_media_loaded(&mut self, event: LoadEvent) -> anyhow::Result<()> {
        let Some(source) = &mut self.source else {
            return Ok(());
        };
        let Some(mut chunk) = self.queue.pop() else {
            return Ok(());
        };
        match event.outcome {
            LoadOutcome::Completed(response) => {
                if chunk.is_preload
                    && source.chunk_publication_state(&mut self.tracker, &chunk) == PublicationState::Removed
                {
                    println!("discard msn={} part={:?}, no longer published", chunk.media_sequence, chunk.part_index);
                    return Ok(());
                }
                let bytes = response.body.len() as u64;
                source.on_chunk_load_completed(&mut chunk, bytes, event.elapsed);
                tracing::debug!(
                    bytes,
                    elapsed = ?event.elapsed,
                    estimate = source.selection().bandwidth_estimate(),
                    "Chunk loaded"
                );
                self.load_position_us = chunk.end_time_us;
                if self.playback.is_none() {
                    self.playback = Some(Playback {
                        position_us: chunk.start_time_us,
                        updated_at: self.clock.monotonic(),
                    });
                }
                self.queue.push(chunk);
            }
            LoadOutcome::Failed(e) => {
                tracing::warn!(url = %chunk.url, "Failed to load chunk: {e}");
                if let Err(e) = source.on_chunk_load_error(&chunk) {
                    tracing::warn!("{e}, retrying the same track");
                }
            }
            LoadOutcome::Canceled => {}
        }
        Ok(())
    }
}

/// Excludes the selected track after one of its keys failed to load. The last
/// usable track stays selected.
fn exclude_selected_track<S: TrackSelection>(source: &mut ChunkSource<S>, exclusion: Duration) {
    let index = source.selection().selected_index();
    match source.exclude_track(index, exclusion) {
        Ok(()) => {}
        Err(IoriError::TrackExclusionExhausted(_)) => {
            tracing::warn!(track = index, "No other track to switch to, keeping it")
        }
        Err(e) => tracing::warn!(track = index, "Failed to exclude track: {e}"),
    }
}
