use std::sync::Arc;

use url::Url;

use crate::{
    model::{ByteRange, MediaPlaylist, SegmentBase},
    time::TimeUs,
};

/// Upcoming unit of a track, as seen by a track selection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDescriptor {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    pub media_sequence: u64,
    pub part_index: Option<usize>,
    pub start_time_us: TimeUs,
    pub end_time_us: TimeUs,
    pub is_preload: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Segment(usize),
    Part { segment: usize, part: usize },
    Trailing(usize),
}

/// Lazy iterator over the units of one snapshot, starting at a given media
/// sequence and part index.
///
/// Only indexes are collected up front. Descriptors are built on demand, and
/// [`MediaChunkIterator::reset`] rewinds to the first unit.
#[derive(Debug, Clone)]
pub struct MediaChunkIterator {
    playlist: Option<Arc<MediaPlaylist>>,
    start_of_playlist_us: TimeUs,
    positions: Vec<Position>,
    cursor: usize,
}

impl MediaChunkIterator {
    pub fn empty() -> Self {
        Self {
            playlist: None,
            start_of_playlist_us: 0,
            positions: Vec::new(),
            cursor: 0,
        }
    }

    pub fn new(
        playlist: Arc<MediaPlaylist>,
        start_of_playlist_us: TimeUs,
        media_sequence: u64,
        part_index: Option<usize>,
    ) -> Self {
        let positions = positions(&playlist, media_sequence, part_index);
        Self {
            playlist: Some(playlist),
            start_of_playlist_us,
            positions,
            cursor: 0,
        }
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn is_ended(&self) -> bool {
        self.cursor >= self.positions.len()
    }

    /// Number of units left.
    pub fn remaining(&self) -> usize {
        self.positions.len() - self.cursor.min(self.positions.len())
    }

    fn describe(&self, position: Position) -> Option<ChunkDescriptor> {
        let playlist = self.playlist.as_ref()?;
        let (base, media_sequence, part_index, is_preload): (&SegmentBase, u64, Option<usize>, bool) =
            match position {
                Position::Segment(index) => {
                    let segment = playlist.segments.get(index)?;
                    (&segment.base, playlist.media_sequence + index as u64, None, false)
                }
                Position::Part { segment, part } => {
                    let p = playlist.segments.get(segment)?.parts.get(part)?;
                    (&p.base, playlist.media_sequence + segment as u64, Some(part), p.is_preload)
                }
                Position::Trailing(part) => {
                    let p = playlist.trailing_parts.get(part)?;
                    (&p.base, playlist.next_media_sequence(), Some(part), p.is_preload)
                }
            };
        let start_time_us = self.start_of_playlist_us + base.relative_start_time_us;
        Some(ChunkDescriptor {
            url: base.url.clone(),
            byte_range: base.byte_range,
            media_sequence,
            part_index,
            start_time_us,
            end_time_us: start_time_us + base.duration_or_zero() as TimeUs,
            is_preload,
        })
    }
}

impl Iterator for MediaChunkIterator {
    type Item = ChunkDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let position = *self.positions.get(self.cursor)?;
        self.cursor += 1;
        self.describe(position)
    }
}

/// Units from `media_sequence`/`part_index` to the end of the snapshot.
///
/// Starting at part 0 of a segment yields the whole segment instead. Trailing
/// parts are only listed for low-latency playlists.
fn positions(playlist: &MediaPlaylist, media_sequence: u64, part_index: Option<usize>) -> Vec<Position> {
    let Some(first) = media_sequence.checked_sub(playlist.media_sequence) else {
        return Vec::new();
    };
    let mut first = first as usize;
    if first > playlist.segments.len() {
        return Vec::new();
    }

    let mut positions = Vec::new();
    let mut trailing_from = part_index;
    if first < playlist.segments.len() {
        if let Some(part) = part_index {
            let segment = &playlist.segments[first];
            if part == 0 {
                positions.push(Position::Segment(first));
            } else if part < segment.parts.len() {
                positions.extend((part..segment.parts.len()).map(|part| Position::Part { segment: first, part }));
            }
            first += 1;
        }
        trailing_from = Some(0);
        positions.extend((first..playlist.segments.len()).map(Position::Segment));
    }
    if playlist.part_target_duration_us.is_some() {
        let from = trailing_from.unwrap_or(0);
        positions.extend((from..playlist.trailing_parts.len()).map(Position::Trailing));
    }
    positions
}
