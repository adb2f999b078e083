use std::time::Duration;

use bytes::Bytes;
use url::Url;

use super::{
    KeyRequest, MediaChunk, MediaChunkIterator, NextChunk, PublicationState, SeekMode,
    SelectionInput, TrackInfo, TrackSelection,
};
use crate::{
    config::ChunkSourceConfig,
    error::{IoriError, IoriResult},
    keys::KeyCache,
    model::{MediaPlaylist, Part, Segment, SegmentBase},
    time::{SharedClock, TimeUs},
    tracker::PlaylistProvider,
};

/// Playback state at the time a chunk is requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadingInfo {
    pub playback_position_us: TimeUs,
}

/// The unit a media sequence number and part index resolve to.
struct SegmentHolder<'a> {
    base: &'a SegmentBase,
    media_sequence: u64,
    part_index: Option<usize>,
    is_preload: bool,
    /// Independence flag of a part. Whole segments rely on the playlist flag.
    part_independent: Option<bool>,
}

impl SegmentHolder<'_> {
    fn is_independent(&self, playlist: &MediaPlaylist) -> bool {
        match self.part_independent {
            Some(independent) => {
                independent || (self.part_index == Some(0) && playlist.has_independent_segments)
            }
            None => playlist.has_independent_segments,
        }
    }
}

impl<'a> SegmentHolder<'a> {
    fn segment(segment: &'a Segment, media_sequence: u64) -> Self {
        Self {
            base: &segment.base,
            media_sequence,
            part_index: None,
            is_preload: false,
            part_independent: None,
        }
    }

    fn part(part: &'a Part, media_sequence: u64, part_index: usize) -> Self {
        Self {
            base: &part.base,
            media_sequence,
            part_index: Some(part_index),
            is_preload: part.is_preload,
            part_independent: Some(part.is_independent),
        }
    }
}

fn segment_holder(playlist: &MediaPlaylist, media_sequence: u64, part_index: Option<usize>) -> Option<SegmentHolder<'_>> {
    let index = media_sequence.checked_sub(playlist.media_sequence)? as usize;
    if index == playlist.segments.len() {
        let part = part_index.unwrap_or(0);
        return playlist
            .trailing_parts
            .get(part)
            .map(|p| SegmentHolder::part(p, media_sequence, part));
    }
    let segment = playlist.segments.get(index)?;
    let Some(part) = part_index else {
        return Some(SegmentHolder::segment(segment, media_sequence));
    };
    if let Some(p) = segment.parts.get(part) {
        return Some(SegmentHolder::part(p, media_sequence, part));
    }
    // the segment is complete, move on
    if let Some(next) = playlist.segments.get(index + 1) {
        return Some(SegmentHolder::segment(next, media_sequence + 1));
    }
    playlist
        .trailing_parts
        .first()
        .map(|p| SegmentHolder::part(p, media_sequence + 1, 0))
}

/// Index of the last segment starting at or before `position_us`, relative to the playlist.
///
/// Positions before the first segment resolve to it when `stay_in_bounds` is set.
fn floor_segment(playlist: &MediaPlaylist, position_us: TimeUs, stay_in_bounds: bool) -> Option<usize> {
    let count = playlist
        .segments
        .partition_point(|s| s.base.relative_start_time_us <= position_us);
    match count.checked_sub(1) {
        Some(index) => Some(index),
        None if stay_in_bounds => Some(0),
        None => None,
    }
}

/// Decides which chunk to load next for a group of interchangeable tracks.
pub struct ChunkSource<S> {
    tracks: Vec<TrackInfo>,
    selection: S,
    config: ChunkSourceConfig,
    clock: SharedClock,
    key_cache: KeyCache,
    excluded_until: Vec<Option<Duration>>,

    independent_segments: bool,
    live_edge_in_period_us: Option<TimeUs>,
    /// Playlist the last call blocked on.
    expected_playlist_url: Option<Url>,
    seen_expected_playlist_error: bool,
}

impl<S> ChunkSource<S>
where
    S: TrackSelection,
{
    pub fn new(tracks: Vec<TrackInfo>, selection: S, config: ChunkSourceConfig, clock: SharedClock) -> IoriResult<Self> {
        if tracks.is_empty() {
            return Err(IoriError::NoTracks);
        }
        let key_cache = KeyCache::new(config.key_cache_capacity);
        Ok(Self {
            excluded_until: vec![None; tracks.len()],
            tracks,
            selection,
            config,
            clock,
            key_cache,
            independent_segments: false,
            live_edge_in_period_us: None,
            expected_playlist_url: None,
            seen_expected_playlist_error: false,
        })
    }

    pub fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    pub fn selection(&self) -> &S {
        &self.selection
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.key_cache
    }

    /// The playlist the last call blocked on, once a load of it has failed.
    pub fn failed_expected_playlist(&self) -> Option<&Url> {
        self.expected_playlist_url
            .as_ref()
            .filter(|_| self.seen_expected_playlist_error)
    }

    fn track_index_of(&self, url: &Url) -> Option<usize> {
        self.tracks.iter().position(|t| &t.url == url)
    }

    fn excluded_flags(&self) -> Vec<bool> {
        let now = self.clock.monotonic();
        self.excluded_until
            .iter()
            .map(|until| until.is_some_and(|until| now < until))
            .collect()
    }

    pub fn is_excluded(&self, index: usize) -> bool {
        self.excluded_flags().get(index).copied().unwrap_or(false)
    }

    /// Excludes a track from selection for `duration`.
    ///
    /// Fails with [`IoriError::TrackExclusionExhausted`] when every other track is
    /// already excluded.
    pub fn exclude_track(&mut self, index: usize, duration: Duration) -> IoriResult<()> {
        let excluded = self.excluded_flags();
        let others_available = excluded.iter().enumerate().any(|(i, e)| i != index && !e);
        if index >= self.tracks.len() || !others_available {
            return Err(IoriError::TrackExclusionExhausted(index));
        }
        tracing::info!(track = index, url = %self.tracks[index].url, "Excluding track for {duration:?}");
        self.excluded_until[index] = Some(self.clock.monotonic() + duration);
        Ok(())
    }

    /// Reacts to a failed playlist load.
    ///
    /// With an `exclusion` duration, the track and its playlist are excluded.
    /// Returns `false` when that was not possible and the error should be
    /// treated as fatal for this group.
    pub fn on_playlist_error<P>(&mut self, provider: &mut P, url: &Url, exclusion: Option<Duration>) -> bool
    where
        P: PlaylistProvider,
    {
        let Some(index) = self.track_index_of(url) else {
            return true;
        };
        self.seen_expected_playlist_error |= self.expected_playlist_url.as_ref() == Some(url);
        let Some(exclusion) = exclusion else {
            return true;
        };
        self.exclude_track(index, exclusion).is_ok() && provider.exclude_media_playlist(url, exclusion)
    }

    /// Excludes the track of a chunk that failed to load, for the configured default duration.
    pub fn on_chunk_load_error(&mut self, chunk: &MediaChunk) -> IoriResult<()> {
        self.exclude_track(chunk.track_index, Duration::from_millis(self.config.default_exclusion_ms))
    }

    pub fn on_chunk_load_completed(&mut self, chunk: &mut MediaChunk, bytes: u64, elapsed: Duration) {
        chunk.load_completed = true;
        self.selection.on_chunk_loaded(bytes, elapsed);
    }

    pub fn on_key_loaded(&mut self, url: Url, key: Bytes) {
        self.key_cache.put(url, key);
    }

    fn update_live_edge<P: PlaylistProvider>(&mut self, provider: &P, playlist: &MediaPlaylist) {
        self.live_edge_in_period_us = (!playlist.has_end_tag)
            .then(|| playlist.end_time_us() - provider.initial_start_time_us());
    }

    fn block_on<P: PlaylistProvider>(&mut self, provider: &mut P, url: Url) -> NextChunk {
        self.seen_expected_playlist_error &= self.expected_playlist_url.as_ref() == Some(&url);
        self.expected_playlist_url = Some(url.clone());
        provider.refresh_playlist(&url);
        NextChunk::BlockedOnPlaylist(url)
    }

    /// Media sequence and part index to load next from `playlist`.
    ///
    /// `None` as media sequence means the position lies before the playlist.
    fn next_position(
        &self,
        is_live: bool,
        previous: Option<&MediaChunk>,
        switching_track: bool,
        playlist: &MediaPlaylist,
        start_of_playlist_us: TimeUs,
        load_position_us: TimeUs,
    ) -> (Option<u64>, Option<usize>) {
        if let Some(previous) = previous.filter(|_| !switching_track) {
            if !previous.load_completed {
                return (Some(previous.media_sequence), previous.part_index);
            }
            return match previous.part_index {
                None => (Some(previous.next_media_sequence()), None),
                Some(part) => (Some(previous.media_sequence), Some(part + 1)),
            };
        }

        let end_of_playlist_us = start_of_playlist_us + playlist.duration_us as TimeUs;
        let target_us = match previous {
            Some(previous) if !self.independent_segments => previous.start_time_us,
            _ => load_position_us,
        };
        if (!playlist.has_end_tag && target_us >= end_of_playlist_us) || playlist.segments.is_empty() {
            return (Some(playlist.next_media_sequence()), None);
        }

        let target_in_playlist_us = target_us - start_of_playlist_us;
        let Some(index) = floor_segment(playlist, target_in_playlist_us, !is_live || previous.is_none()) else {
            return (None, None);
        };
        let mut media_sequence = playlist.media_sequence + index as u64;
        let mut part_index = None;

        let segment = &playlist.segments[index];
        let (parts, trailing) = if target_in_playlist_us < segment.base.relative_end_time_us() {
            (&segment.parts, false)
        } else {
            (&playlist.trailing_parts, true)
        };
        if let Some((i, part)) = parts
            .iter()
            .enumerate()
            .find(|(_, p)| target_in_playlist_us < p.base.relative_end_time_us())
        {
            // only independent parts are safe to start from
            if part.is_independent {
                part_index = Some(i);
                if trailing {
                    media_sequence += 1;
                }
            }
        }
        (Some(media_sequence), part_index)
    }

    fn create_iterators<P: PlaylistProvider>(
        &self,
        provider: &mut P,
        previous: Option<&MediaChunk>,
        load_position_us: TimeUs,
    ) -> Vec<MediaChunkIterator> {
        let is_live = provider.is_live();
        let initial_start_time_us = provider.initial_start_time_us();
        (0..self.tracks.len())
            .map(|index| {
                let url = &self.tracks[index].url;
                if !provider.is_snapshot_valid(url) {
                    return MediaChunkIterator::empty();
                }
                let Some(playlist) = provider.playlist_snapshot(url, false) else {
                    return MediaChunkIterator::empty();
                };
                let start_of_playlist_us = playlist.start_time_us - initial_start_time_us;
                let switching = previous.map(|p| p.track_index) != Some(index);
                match self.next_position(is_live, previous, switching, &playlist, start_of_playlist_us, load_position_us) {
                    (Some(media_sequence), part_index) => {
                        MediaChunkIterator::new(playlist, start_of_playlist_us, media_sequence, part_index)
                    }
                    (None, _) => MediaChunkIterator::empty(),
                }
            })
            .collect()
    }

    /// Returns a key request when `url` is not cached yet. A cached key is
    /// checked out and put back, to mark it as recently used.
    fn key_request(&mut self, url: Option<&Url>, track_index: usize, for_init_segment: bool) -> Option<KeyRequest> {
        let url = url?;
        if let Some(key) = self.key_cache.remove(url) {
            self.key_cache.put(url.clone(), key);
            return None;
        }
        Some(KeyRequest {
            url: url.clone(),
            track_index,
            for_init_segment,
        })
    }

    /// Decides what to load next.
    ///
    /// `queue` holds the chunks loaded or loading for this group, oldest first.
    /// `largest_read_position_us` is the furthest position handed to the decoder;
    /// a track switch never resolves to a chunk starting at or before it.
    pub fn get_next_chunk<P>(
        &mut self,
        provider: &mut P,
        loading: &LoadingInfo,
        load_position_us: TimeUs,
        largest_read_position_us: Option<TimeUs>,
        queue: &[MediaChunk],
        allow_end_of_stream: bool,
    ) -> IoriResult<NextChunk>
    where
        P: PlaylistProvider,
    {
        let previous = queue.last();
        let old_track = previous.map(|c| c.track_index);

        let mut buffered_duration_us = load_position_us - loading.playback_position_us;
        let mut time_to_live_edge_us = self
            .live_edge_in_period_us
            .map(|edge| edge - loading.playback_position_us);
        if let Some(previous) = previous.filter(|_| !self.independent_segments) {
            // switching needs the previous chunk again
            let subtracted = previous.duration_us();
            buffered_duration_us = (buffered_duration_us - subtracted).max(0);
            time_to_live_edge_us = time_to_live_edge_us.map(|t| (t - subtracted).max(0));
        }

        let iterators = self.create_iterators(provider, previous, load_position_us);
        let excluded = self.excluded_flags();
        self.selection.update_selected_track(&SelectionInput {
            playback_position_us: loading.playback_position_us,
            buffered_duration_us,
            time_to_live_edge_us,
            queue,
            iterators: &iterators,
            excluded: &excluded,
        });

        let mut track = self.selection.selected_index().min(self.tracks.len() - 1);
        let mut url = self.tracks[track].url.clone();
        if !provider.is_snapshot_valid(&url) {
            return Ok(self.block_on(provider, url));
        }
        let Some(mut playlist) = provider.playlist_snapshot(&url, true) else {
            return Ok(self.block_on(provider, url));
        };
        self.independent_segments = playlist.has_independent_segments;
        self.update_live_edge(provider, &playlist);

        let is_live = provider.is_live();
        let initial_start_time_us = provider.initial_start_time_us();
        let mut start_of_playlist_us = playlist.start_time_us - initial_start_time_us;
        let switching = old_track != Some(track);
        let (mut media_sequence, mut part_index) =
            self.next_position(is_live, previous, switching, &playlist, start_of_playlist_us, load_position_us);

        if let Some(previous) = previous.filter(|_| switching) {
            let behind = media_sequence.map_or(true, |msn| msn < playlist.media_sequence);
            let thrashing = !behind
                && largest_read_position_us.is_some_and(|largest| {
                    media_sequence
                        .and_then(|msn| segment_holder(&playlist, msn, part_index))
                        .is_some_and(|h| start_of_playlist_us + h.base.relative_start_time_us <= largest)
                });
            if behind || thrashing {
                let old_url = self.tracks[previous.track_index].url.clone();
                if let Some(old_playlist) = provider.playlist_snapshot(&old_url, true) {
                    tracing::debug!(
                        from = previous.track_index,
                        to = track,
                        behind,
                        "Keeping the previous track for this chunk"
                    );
                    track = previous.track_index;
                    url = old_url;
                    playlist = old_playlist;
                    start_of_playlist_us = playlist.start_time_us - initial_start_time_us;
                    (media_sequence, part_index) = self.next_position(
                        is_live,
                        Some(previous),
                        false,
                        &playlist,
                        start_of_playlist_us,
                        load_position_us,
                    );
                }
            }
        }
        if let Some(old) = old_track.filter(|old| *old != track) {
            provider.deactivate_playlist_for_playback(&self.tracks[old].url);
        }

        let Some(media_sequence) = media_sequence.filter(|msn| *msn >= playlist.media_sequence) else {
            tracing::warn!(url = %url, first = playlist.media_sequence, "Fell behind the live window");
            return Err(IoriError::BehindLiveWindow);
        };

        let holder = match segment_holder(&playlist, media_sequence, part_index) {
            Some(holder) => holder,
            None if !playlist.has_end_tag => return Ok(self.block_on(provider, url)),
            None if allow_end_of_stream || playlist.segments.is_empty() => return Ok(NextChunk::EndOfStream),
            None => {
                // the tail of an ended playlist
                let index = playlist.segments.len() - 1;
                SegmentHolder::segment(&playlist.segments[index], playlist.media_sequence + index as u64)
            }
        };
        self.seen_expected_playlist_error = false;
        self.expected_playlist_url = None;

        let init_key_url = holder
            .base
            .init_segment
            .as_ref()
            .and_then(|init| init.full_segment_key.as_ref());
        if let Some(request) = self.key_request(init_key_url, track, true) {
            return Ok(NextChunk::Key(request));
        }
        if let Some(request) = self.key_request(holder.base.full_segment_key.as_ref(), track, false) {
            return Ok(NextChunk::Key(request));
        }

        let start_time_us = start_of_playlist_us + holder.base.relative_start_time_us;
        let is_independent = holder.is_independent(&playlist);
        let should_splice = match previous {
            None => false,
            Some(previous) if previous.playlist_url == url && previous.load_completed => false,
            Some(previous) => !is_independent || start_time_us < previous.end_time_us,
        };
        if should_splice && holder.is_preload {
            // a spliced preload part can not be discarded if it changes
            return Ok(NextChunk::Deferred);
        }

        let init_segment_key = init_key_url.and_then(|u| self.key_cache.get(u));
        let key = holder
            .base
            .full_segment_key
            .as_ref()
            .and_then(|u| self.key_cache.get(u));
        Ok(NextChunk::Media(MediaChunk {
            track_index: track,
            playlist_url: url,
            url: holder.base.url.clone(),
            byte_range: holder.base.byte_range,
            media_sequence: holder.media_sequence,
            part_index: holder.part_index,
            start_time_us,
            end_time_us: start_time_us + holder.base.duration_or_zero() as TimeUs,
            is_preload: holder.is_preload,
            is_independent,
            should_splice,
            discontinuity_sequence: playlist.discontinuity_sequence
                + holder.base.relative_discontinuity_sequence,
            init_segment: holder.base.init_segment.as_deref().cloned(),
            init_segment_key,
            key,
            iv: holder.base.encryption_iv.clone(),
            load_completed: false,
        }))
    }

    /// Whether a part chunk still exists, unchanged, in the latest snapshot.
    pub fn chunk_publication_state<P>(&self, provider: &mut P, chunk: &MediaChunk) -> PublicationState
    where
        P: PlaylistProvider,
    {
        let Some(part_index) = chunk.part_index else {
            // whole segments are never withdrawn
            return PublicationState::Published;
        };
        let Some(playlist) = provider.playlist_snapshot(&chunk.playlist_url, false) else {
            return PublicationState::Published;
        };
        let Some(index) = chunk.media_sequence.checked_sub(playlist.media_sequence) else {
            // the parent segment slid out of the playlist
            return PublicationState::Published;
        };
        let parts = match playlist.segments.get(index as usize) {
            Some(segment) => &segment.parts,
            None => &playlist.trailing_parts,
        };
        match parts.get(part_index) {
            None => PublicationState::Removed,
            Some(part) if part.is_preload => PublicationState::Preload,
            Some(part) if part.base.url == chunk.url => PublicationState::Published,
            Some(_) => PublicationState::Removed,
        }
    }

    /// Moves a seek target onto a segment boundary of the selected track.
    ///
    /// Only playlists with independent segments have known sync points; other
    /// positions are returned unchanged.
    pub fn adjusted_seek_position_us<P>(&self, provider: &mut P, position_us: TimeUs, mode: SeekMode) -> TimeUs
    where
        P: PlaylistProvider,
    {
        let index = self.selection.selected_index();
        let Some(track) = self.tracks.get(index) else {
            return position_us;
        };
        let Some(playlist) = provider.playlist_snapshot(&track.url, true) else {
            return position_us;
        };
        if playlist.segments.is_empty() || !playlist.has_independent_segments {
            return position_us;
        }
        let start_of_playlist_us = playlist.start_time_us - provider.initial_start_time_us();
        let relative_us = position_us - start_of_playlist_us;
        let index = floor_segment(&playlist, relative_us, true).unwrap_or(0);
        let first_sync_us = playlist.segments[index].base.relative_start_time_us;
        let second_sync_us = playlist
            .segments
            .get(index + 1)
            .map_or(first_sync_us, |s| s.base.relative_start_time_us);
        mode.resolve(relative_us, first_sync_us, second_sync_us) + start_of_playlist_us
    }
}
