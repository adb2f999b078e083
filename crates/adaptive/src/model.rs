//! Immutable segment model shared by the HLS and DASH parsers.

mod playlist;
mod range;
mod segment;

pub use playlist::*;
pub use range::*;
pub use segment::*;
