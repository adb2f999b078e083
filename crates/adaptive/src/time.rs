use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Media timeline position or duration in microseconds.
pub type TimeUs = i64;

pub const MICROS_PER_SECOND: i64 = 1_000_000;
pub const MICROS_PER_MILLI: i64 = 1_000;

pub fn secs_to_us(secs: f64) -> TimeUs {
    (secs * MICROS_PER_SECOND as f64) as TimeUs
}

pub fn ms_to_us(ms: u64) -> TimeUs {
    ms as TimeUs * MICROS_PER_MILLI
}

pub fn duration_to_us(duration: Duration) -> TimeUs {
    duration.as_micros().min(i64::MAX as u128) as TimeUs
}

/// Converts a microsecond value into a [`Duration`], clamping negative values to zero.
pub fn us_to_duration(us: TimeUs) -> Duration {
    Duration::from_micros(us.max(0) as u64)
}

pub fn delta_to_us(delta: TimeDelta) -> TimeUs {
    delta.num_microseconds().unwrap_or(if delta < TimeDelta::zero() {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// `value * multiplier / divisor` without overflowing the intermediate product.
pub fn scale_large_timestamp(value: i64, multiplier: i64, divisor: i64) -> i64 {
    if divisor == 0 {
        return 0;
    }
    ((value as i128 * multiplier as i128) / divisor as i128) as i64
}

/// Time source consulted for refresh scheduling and live-window math.
///
/// `monotonic` is measured from an arbitrary fixed origin and never goes backwards.
/// `wall_clock` is the local notion of the current UTC time, before any server
/// offset correction.
pub trait Clock: Send + Sync {
    fn monotonic(&self) -> Duration;

    fn wall_clock(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    inner: Mutex<(Duration, DateTime<Utc>)>,
}

impl ManualClock {
    pub fn new(wall_clock: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new((Duration::ZERO, wall_clock)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.0 += by;
        inner.1 += TimeDelta::from_std(by).unwrap_or(TimeDelta::zero());
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.inner.lock().0
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        self.inner.lock().1
    }
}
