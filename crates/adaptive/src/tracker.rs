//! Manifest trackers.
//!
//! Trackers never perform IO themselves. The owner polls them for
//! [`LoadRequest`]s, executes the requests, and feeds the outcome back with the
//! id of the request. A completion carrying an id the tracker no longer waits
//! for is dropped without touching any state, which makes out-of-order and
//! canceled loads harmless.

mod dash;
mod hls;
mod window;

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use url::Url;

pub use dash::DashManifestTracker;
pub use hls::{HlsPlaylistTracker, TrackerEvent};
pub use window::*;

use crate::{
    model::{ByteRange, MediaPlaylist},
    time::TimeUs,
};

static NEXT_LOAD_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one load attempt. Ids are unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadId(u64);

impl LoadId {
    pub fn next() -> Self {
        Self(NEXT_LOAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LoadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadKind {
    /// A DASH MPD or the initial HLS playlist.
    Manifest,
    /// A HLS media playlist.
    Playlist,
    /// A server time request for clock synchronization.
    TimingSync,
    Key,
    Media,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub id: LoadId,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    pub kind: LoadKind,
}

impl LoadRequest {
    pub fn new(url: Url, kind: LoadKind) -> Self {
        Self {
            id: LoadId::next(),
            url,
            byte_range: None,
            kind,
        }
    }
}

/// Lifecycle of a tracked resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceState<S> {
    Idle,
    Loading,
    Live(Arc<S>),
    Static(Arc<S>),
    FatalError,
}

impl<S> ResourceState<S> {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalError)
    }

    pub fn snapshot(&self) -> Option<&Arc<S>> {
        match self {
            Self::Live(snapshot) | Self::Static(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// Media playlist snapshots as seen by the chunk source.
pub trait PlaylistProvider {
    /// Whether the snapshot of `url` is recent enough to select chunks from.
    fn is_snapshot_valid(&self, url: &Url) -> bool;

    /// Latest snapshot of a media playlist.
    ///
    /// Asking `for_playback` marks the playlist as in use, so it keeps being refreshed.
    fn playlist_snapshot(&mut self, url: &Url, for_playback: bool) -> Option<Arc<MediaPlaylist>>;

    /// Start time of the first primary snapshot. Chunk times are relative to it.
    fn initial_start_time_us(&self) -> TimeUs;

    fn is_live(&self) -> bool;

    /// Requests a reload of a playlist, honouring its minimum reload interval.
    fn refresh_playlist(&mut self, url: &Url);

    /// Stops using a playlist for a while. Returns `false` when the playlist can not
    /// be excluded, for example because no other variant is left.
    fn exclude_media_playlist(&mut self, url: &Url, exclusion: Duration) -> bool;

    /// The playlist is no longer played and only needs refreshing when primary.
    fn deactivate_playlist_for_playback(&mut self, _url: &Url) {}
}
