//! Live HLS and DASH manifest tracking and chunk selection.
//!
//! ```text
//! ┌────────────────────┐   LoadRequest   ┌──────────┐
//! │                    ├─────────────────►          │
//! │  Manifest tracker  │                 │  Loader  │
//! │   (HLS or DASH)    ◄─────────────────┤          │
//! │                    │    LoadEvent    └────▲─────┘
//! └─────────┬──────────┘                      │
//!           │ PlaylistProvider                │ key / media
//!           │                                 │
//! ┌─────────▼──────────┐    NextChunk         │
//! │    ChunkSource     ├──────────────────────┘
//! │ + TrackSelection   │
//! └────────────────────┘
//! ```
//!
//! Trackers and chunk sources are plain state machines. The task owning them
//! feeds load outcomes back and asks for the next chunk, so nothing here is
//! shared across threads.

pub mod chunk;
pub mod config;
pub mod dash;
pub mod error;
pub mod fetch;
pub mod hls;
pub mod keys;
pub mod model;
pub mod time;
pub mod tracker;

pub use chunk::{ChunkSource, NextChunk};
pub use error::{IoriError, IoriResult};
pub use tracker::{DashManifestTracker, HlsPlaylistTracker, PlaylistProvider, ResourceState};
