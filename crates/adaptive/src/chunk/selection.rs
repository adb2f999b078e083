use std::time::Duration;

use super::{MediaChunk, MediaChunkIterator};
use crate::{
    config::AdaptiveConfig,
    time::{ms_to_us, TimeUs},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    Initial,
    Manual,
    Adaptive,
}

/// Everything a track selection may base its decision on.
pub struct SelectionInput<'a> {
    pub playback_position_us: TimeUs,
    pub buffered_duration_us: TimeUs,
    /// `None` for content without a live edge.
    pub time_to_live_edge_us: Option<TimeUs>,
    pub queue: &'a [MediaChunk],
    /// Upcoming chunks of every track, indexed like the tracks.
    pub iterators: &'a [MediaChunkIterator],
    /// Whether each track is currently excluded.
    pub excluded: &'a [bool],
}

impl SelectionInput<'_> {
    pub fn is_excluded(&self, index: usize) -> bool {
        self.excluded.get(index).copied().unwrap_or(true)
    }

    /// Lowest track index that is not excluded.
    pub fn first_available(&self) -> Option<usize> {
        self.excluded.iter().position(|excluded| !excluded)
    }
}

/// Picks the track the next chunk is loaded from.
///
/// Implementations must be deterministic for identical inputs and must select a
/// track that is not excluded whenever one exists.
pub trait TrackSelection {
    fn selected_index(&self) -> usize;

    fn selection_reason(&self) -> SelectionReason;

    fn update_selected_track(&mut self, input: &SelectionInput<'_>);

    /// A media chunk finished loading.
    fn on_chunk_loaded(&mut self, _bytes: u64, _elapsed: Duration) {}
}

/// Always the same track, or the first usable one while it is excluded.
#[derive(Debug, Clone)]
pub struct FixedTrackSelection {
    preferred: usize,
    selected: usize,
    reason: SelectionReason,
}

impl FixedTrackSelection {
    pub fn new(index: usize) -> Self {
        Self {
            preferred: index,
            selected: index,
            reason: SelectionReason::Manual,
        }
    }
}

impl TrackSelection for FixedTrackSelection {
    fn selected_index(&self) -> usize {
        self.selected
    }

    fn selection_reason(&self) -> SelectionReason {
        self.reason
    }

    fn update_selected_track(&mut self, input: &SelectionInput<'_>) {
        self.selected = if input.is_excluded(self.preferred) {
            input.first_available().unwrap_or(self.preferred)
        } else {
            self.preferred
        };
    }
}

/// Exponentially weighted moving average of the observed throughput.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    alpha: f64,
    min_sample: Duration,
    estimate: f64,
}

impl ThroughputMeter {
    pub fn new(initial_estimate: u64, alpha: f64, min_sample: Duration) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            min_sample,
            estimate: initial_estimate as f64,
        }
    }

    pub fn add_sample(&mut self, bytes: u64, elapsed: Duration) {
        if elapsed < self.min_sample || elapsed.is_zero() {
            return;
        }
        let bits_per_second = bytes as f64 * 8.0 / elapsed.as_secs_f64();
        self.estimate = self.alpha * bits_per_second + (1.0 - self.alpha) * self.estimate;
    }

    /// Estimated bandwidth in bits per second.
    pub fn estimate(&self) -> u64 {
        self.estimate as u64
    }
}

/// Bandwidth driven selection with buffer based switch hysteresis.
#[derive(Debug, Clone)]
pub struct AdaptiveTrackSelection {
    bandwidths: Vec<u64>,
    config: AdaptiveConfig,
    meter: ThroughputMeter,
    selected: usize,
    reason: SelectionReason,
    initialized: bool,
}

impl AdaptiveTrackSelection {
    pub fn new(bandwidths: Vec<u64>, config: AdaptiveConfig) -> Self {
        let meter = ThroughputMeter::new(
            config.initial_bandwidth_estimate,
            config.throughput_alpha,
            Duration::from_millis(config.min_sample_duration_ms),
        );
        Self {
            bandwidths,
            config,
            meter,
            selected: 0,
            reason: SelectionReason::Initial,
            initialized: false,
        }
    }

    pub fn bandwidth_estimate(&self) -> u64 {
        self.meter.estimate()
    }

    /// Highest bandwidth track that fits the estimate, or the lowest usable one.
    fn ideal_index(&self, input: &SelectionInput<'_>) -> Option<usize> {
        let effective = self.meter.estimate() as f64 * self.config.bandwidth_fraction;
        let usable = || {
            self.bandwidths
                .iter()
                .enumerate()
                .filter(|(i, _)| !input.is_excluded(*i))
        };
        usable()
            .filter(|(_, bandwidth)| **bandwidth as f64 <= effective)
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
            .or_else(|| usable().min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(&b.0))))
            .map(|(i, _)| i)
    }

    fn min_duration_for_up_switch_us(&self, time_to_live_edge_us: Option<TimeUs>) -> TimeUs {
        let min = ms_to_us(self.config.min_buffer_for_up_switch_ms);
        match time_to_live_edge_us {
            Some(available) if available <= min => {
                (available as f64 * self.config.live_edge_fraction_for_up_switch) as TimeUs
            }
            _ => min,
        }
    }
}

impl TrackSelection for AdaptiveTrackSelection {
    fn selected_index(&self) -> usize {
        self.selected
    }

    fn selection_reason(&self) -> SelectionReason {
        self.reason
    }

    fn update_selected_track(&mut self, input: &SelectionInput<'_>) {
        let Some(ideal) = self.ideal_index(input) else {
            return;
        };
        if !self.initialized {
            self.initialized = true;
            self.selected = ideal;
            self.reason = SelectionReason::Initial;
            return;
        }
        let previous = self.selected;
        if ideal == previous {
            return;
        }

        let mut next = ideal;
        if !input.is_excluded(previous) {
            let previous_bandwidth = self.bandwidths[previous];
            let ideal_bandwidth = self.bandwidths[ideal];
            let min_for_up = self.min_duration_for_up_switch_us(input.time_to_live_edge_us);
            let max_for_down = ms_to_us(self.config.max_buffer_for_down_switch_ms);
            if ideal_bandwidth > previous_bandwidth && input.buffered_duration_us < min_for_up {
                // not enough buffer to risk a higher bitrate
                next = previous;
            } else if ideal_bandwidth < previous_bandwidth && input.buffered_duration_us >= max_for_down {
                // enough buffer to ride out the slow period
                next = previous;
            }
        }
        if next != previous {
            tracing::debug!(
                from = previous,
                to = next,
                estimate = self.meter.estimate(),
                "Switching track"
            );
            self.selected = next;
            self.reason = SelectionReason::Adaptive;
        }
    }

    fn on_chunk_loaded(&mut self, bytes: u64, elapsed: Duration) {
        self.meter.add_sample(bytes, elapsed);
    }
}
