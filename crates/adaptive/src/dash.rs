//! MPEG-DASH manifest support.
//!
//! An MPD is parsed into a [`DashManifest`] whose representations each own a
//! [`SegmentIndex`]. Live presentations are materialized into media playlists
//! for a given wall clock time, so the rest of the crate only deals with the
//! shared playlist model.
//!
//! Terminology:
//! - Period: a time span of the presentation with its own set of tracks.
//! - AdaptationSet: interchangeable encodings of one component (video, audio, ...).
//! - Representation: one encoding, addressed by `SegmentTemplate`, `SegmentList`
//!   or `SegmentBase`.

mod manifest;
mod parser;
mod template;
mod timing;
mod url;

pub use manifest::*;
pub use parser::parse_mpd;
pub use template::{TemplateArgs, UrlTemplate};
pub use timing::*;
