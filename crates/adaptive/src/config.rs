use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::{ms_to_us, TimeUs};

/// Caller preferences for live playback, all in milliseconds.
///
/// Unset values fall back to what the manifest suggests, then to the
/// protocol defaults in [`TrackerConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfiguration {
    pub target_offset_ms: Option<u64>,
    pub min_offset_ms: Option<u64>,
    pub max_offset_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub live: LiveConfiguration,

    /// Minimum number of times a stale manifest is reloaded before the resource fails.
    pub min_retry_count: u32,
    /// Linear backoff step between stale manifest reloads.
    pub stale_retry_step_ms: u64,
    /// Upper bound for the stale manifest backoff.
    pub stale_retry_max_ms: u64,

    /// Update period used when a DASH manifest declares `minimumUpdatePeriod="PT0S"`.
    pub zero_min_update_period_ms: u64,
    /// Ceiling for timeline-only refreshes of a DASH manifest without explicit update period.
    pub default_refresh_interval_ms: u64,
    /// Target live offset for DASH when neither caller nor manifest specify one.
    pub fallback_target_live_offset_ms: u64,
    /// Preferred minimum distance of the default start position from the live window start.
    pub min_live_default_start_ms: u64,
    /// Most recent segments kept per representation of a dynamic DASH manifest.
    pub max_live_segments: u64,

    /// A HLS playlist that does not change within this many target durations is stuck.
    pub playlist_stuck_coefficient: f64,
    /// Lower bound of how long a loaded live HLS playlist stays usable.
    pub snapshot_validity_floor_ms: u64,
    /// How long a playlist is excluded after its load failed.
    pub default_exclusion_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            live: LiveConfiguration::default(),
            min_retry_count: 3,
            stale_retry_step_ms: 1000,
            stale_retry_max_ms: 5000,
            zero_min_update_period_ms: 5000,
            default_refresh_interval_ms: 5000,
            fallback_target_live_offset_ms: 30_000,
            min_live_default_start_ms: 5000,
            max_live_segments: 3600,
            playlist_stuck_coefficient: 3.5,
            snapshot_validity_floor_ms: 30_000,
            default_exclusion_ms: 60_000,
        }
    }
}

impl TrackerConfig {
    /// Delay before the `attempt`-th stale reload (1-based).
    pub fn stale_retry_delay(&self, attempt: u32) -> Duration {
        let delay = (attempt.saturating_sub(1) as u64).saturating_mul(self.stale_retry_step_ms);
        Duration::from_millis(delay.min(self.stale_retry_max_ms))
    }

    pub fn min_live_default_start_us(&self) -> TimeUs {
        ms_to_us(self.min_live_default_start_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSourceConfig {
    /// Capacity of the decryption key cache. Values below 2 are raised to 2.
    pub key_cache_capacity: usize,
    /// How long a track is excluded after a failed load when the caller gives no duration.
    pub default_exclusion_ms: u64,
}

impl Default for ChunkSourceConfig {
    fn default() -> Self {
        Self {
            key_cache_capacity: 4,
            default_exclusion_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Fraction of the estimated bandwidth a selected track may use.
    pub bandwidth_fraction: f64,
    /// Bandwidth assumed before the first throughput sample, in bits per second.
    pub initial_bandwidth_estimate: u64,
    /// Buffer required before switching to a higher bitrate.
    pub min_buffer_for_up_switch_ms: u64,
    /// Above this buffer level a switch to a lower bitrate is deferred.
    pub max_buffer_for_down_switch_ms: u64,
    /// Near the live edge, the share of the remaining distance that must be buffered
    /// before switching up.
    pub live_edge_fraction_for_up_switch: f64,
    /// Smoothing factor of the throughput estimator, in `(0, 1]`.
    pub throughput_alpha: f64,
    /// Throughput samples shorter than this are ignored.
    pub min_sample_duration_ms: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            bandwidth_fraction: 0.7,
            initial_bandwidth_estimate: 1_000_000,
            min_buffer_for_up_switch_ms: 10_000,
            max_buffer_for_down_switch_ms: 25_000,
            live_edge_fraction_for_up_switch: 0.75,
            throughput_alpha: 0.3,
            min_sample_duration_ms: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_retry_delay() {
        let config = TrackerConfig::default();
        assert_eq!(config.stale_retry_delay(1), Duration::ZERO);
        assert_eq!(config.stale_retry_delay(2), Duration::from_secs(1));
        assert_eq!(config.stale_retry_delay(4), Duration::from_secs(3));
        assert_eq!(config.stale_retry_delay(100), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_config() {
        let config: TrackerConfig =
            serde_json::from_str(r#"{"min_retry_count": 5, "live": {"target_offset_ms": 8000}}"#)
                .unwrap();
        assert_eq!(config.min_retry_count, 5);
        assert_eq!(config.live.target_offset_ms, Some(8000));
        assert_eq!(config.zero_min_update_period_ms, 5000);
    }
}
