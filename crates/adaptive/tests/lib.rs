mod chunk;
mod dash;
mod fetch;
mod hls;
mod window;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use iori_adaptive::{
    fetch::Response,
    time::ManualClock,
    tracker::{LoadKind, LoadRequest},
    HlsPlaylistTracker,
};
use url::Url;

pub trait AssertWrapper {
    type Success;

    fn assert_success(self) -> Self::Success;
    fn assert_error(self);
}

impl<T, E> AssertWrapper for Result<T, E>
where
    E: std::fmt::Debug,
{
    type Success = T;

    fn assert_success(self) -> Self::Success {
        assert!(self.is_ok());

        self.unwrap()
    }

    fn assert_error(self) {
        assert!(self.is_err());
    }
}

impl<T> AssertWrapper for Option<T> {
    type Success = T;

    fn assert_success(self) -> Self::Success {
        assert!(self.is_some());
        self.unwrap()
    }

    fn assert_error(self) {
        assert!(self.is_none());
    }
}

pub fn start_time() -> DateTime<Utc> {
    "2024-01-01T00:01:00Z".parse().unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

pub fn url(path: &str) -> Url {
    Url::parse("https://example.com/live/").unwrap().join(path).unwrap()
}

pub fn response(request: &LoadRequest, body: &str) -> Response {
    Response {
        url: request.url.clone(),
        body: Bytes::from(body.to_string()),
        date: None,
    }
}

/// Answers the single pending load of `kind` with `body`.
pub fn respond(tracker: &mut HlsPlaylistTracker, kind: LoadKind, body: &str) -> LoadRequest {
    let mut loads = tracker.poll_loads();
    assert_eq!(loads.len(), 1, "expected exactly one load");
    let request = loads.remove(0);
    assert_eq!(request.kind, kind);
    tracker.on_load_completed(request.id, response(&request, body));
    request
}
