//! Line-oriented HLS playlist parsing.
//!
//! Both playlist kinds are parsed by pure functions. Media playlists may need the
//! multivariant playlist that referenced them (inherited attributes, session keys,
//! imported variables) and the previous snapshot of the same playlist (delta updates).

mod attributes;
mod parser;

pub use attributes::Variables;
pub use parser::*;

/// Query parameters of a blocking playlist reload.
pub const BLOCK_MSN_PARAM: &str = "_HLS_msn";
pub const BLOCK_PART_PARAM: &str = "_HLS_part";
pub const SKIP_PARAM: &str = "_HLS_skip";
