use chrono::{DateTime, TimeDelta, Utc};
use url::Url;

use super::{manifest::UtcTiming, url::merge_base_urls};
use crate::{
    error::{IoriError, IoriResult},
    time::{delta_to_us, TimeUs},
};

/// Where the server clock of a dynamic manifest can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimingSource {
    /// `urn:mpeg:dash:utc:direct:2014`, the time is the attribute value itself.
    Direct(DateTime<Utc>),
    /// `http-iso` and `http-xsdate`, the response body is the time.
    HttpBody(Url),
    /// `http-head`, the `Date` header of the response is the time.
    HttpHead(Url),
}

impl TimingSource {
    fn from_element(timing: &UtcTiming, base_url: &Url) -> IoriResult<Self> {
        let value = || {
            timing.value.as_deref().ok_or_else(|| {
                IoriError::InvalidTimingSchema(format!("Missing value for {}", timing.scheme_id_uri))
            })
        };
        match timing.scheme_id_uri.as_str() {
            "urn:mpeg:dash:utc:direct:2014" | "urn:mpeg:dash:utc:direct:2012" => {
                Ok(Self::Direct(parse_iso8601(value()?.trim())?))
            }
            "urn:mpeg:dash:utc:http-xsdate:2014"
            | "urn:mpeg:dash:utc:http-iso:2014"
            | "urn:mpeg:dash:utc:http-xsdate:2012"
            | "urn:mpeg:dash:utc:http-iso:2012" => {
                Ok(Self::HttpBody(merge_base_urls(base_url, value()?.trim())?))
            }
            "urn:mpeg:dash:utc:http-head:2014" | "urn:mpeg:dash:utc:http-head:2012" => {
                Ok(Self::HttpHead(merge_base_urls(base_url, value()?.trim())?))
            }
            "urn:mpeg:dash:utc:http-ntp:2014" | "urn:mpeg:dash:utc:ntp:2014" => Err(
                IoriError::InvalidTimingSchema(format!("Unsupported scheme: {}", timing.scheme_id_uri)),
            ),
            others => Err(IoriError::InvalidTimingSchema(others.into())),
        }
    }

    pub fn url(&self) -> Option<&Url> {
        match self {
            Self::Direct(_) => None,
            Self::HttpBody(url) | Self::HttpHead(url) => Some(url),
        }
    }

    /// Reads the server time out of a completed timing request.
    pub fn remote_time(&self, body: &[u8], date: Option<DateTime<Utc>>) -> IoriResult<DateTime<Utc>> {
        match self {
            Self::Direct(time) => Ok(*time),
            Self::HttpBody(_) => {
                let text = String::from_utf8_lossy(body);
                parse_iso8601(text.trim())
            }
            Self::HttpHead(url) => date.ok_or_else(|| {
                tracing::warn!(url = %url, "Missing Date header in timing response");
                IoriError::InvalidTimingSchema("Missing Date header".to_string())
            }),
        }
    }
}

/// Picks the first usable `UTCTiming` element, in document order.
///
/// Returns `None` when the manifest carries no usable element, in which case the
/// local clock is trusted.
pub fn select_timing_source(timings: &[UtcTiming], base_url: &Url) -> Option<TimingSource> {
    if timings.is_empty() {
        tracing::warn!("No UTCTiming elements found in MPD, using local time.");
        return None;
    }
    for timing in timings {
        tracing::debug!(scheme = %timing.scheme_id_uri, value = %timing.value.as_deref().unwrap_or(""), "Attempting to sync time with scheme");
        match TimingSource::from_element(timing, base_url) {
            Ok(source) => return Some(source),
            Err(e) => tracing::warn!(scheme = %timing.scheme_id_uri, error = %e, "Skipping timing element"),
        }
    }
    tracing::warn!("All supported time sync methods failed, using local time.");
    None
}

pub fn parse_iso8601(text: &str) -> IoriResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // xs:dateTime allows a bare Z without fractional seconds
            DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%SZ").map(|dt| dt.with_timezone(&Utc))
        })?)
}

/// How far the local wall clock is behind the server clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockOffset {
    offset: TimeDelta,
}

impl ClockOffset {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Estimates the offset from a server time observed between two local instants.
    ///
    /// The server is assumed to have sampled its clock halfway through the round trip.
    pub fn from_sample(
        remote_now: DateTime<Utc>,
        before_request: DateTime<Utc>,
        after_request: DateTime<Utc>,
    ) -> Self {
        let half_rtt = (after_request - before_request) / 2;
        let server_now = remote_now + half_rtt;
        let offset = server_now - after_request;
        tracing::info!(offset_milliseconds = %offset.num_milliseconds(), "Clock time set to {}, offset calculated", remote_now);
        Self { offset }
    }

    pub fn now(&self, local_now: DateTime<Utc>) -> DateTime<Utc> {
        local_now + self.offset
    }

    pub fn now_unix_us(&self, local_now: DateTime<Utc>) -> TimeUs {
        self.now(local_now).timestamp_micros()
    }

    pub fn offset_us(&self) -> TimeUs {
        delta_to_us(self.offset)
    }
}
