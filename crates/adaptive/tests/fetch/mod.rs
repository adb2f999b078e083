use std::{collections::HashMap, future::Future, time::Duration};

use bytes::Bytes;
use futures::executor::block_on;
use iori_adaptive::{
    config::TrackerConfig,
    fetch::{HttpClient, HttpTransport, LoadOutcome, Loader, Response, Transport},
    model::ByteRange,
    time::SystemClock,
    tracker::{LoadKind, LoadRequest},
    HlsPlaylistTracker, IoriError, IoriResult, PlaylistProvider,
};
use reqwest::{Client, StatusCode};
use url::Url;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::AssertWrapper;

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("iori_adaptive=trace,wiremock=trace")
        .try_init();
}

async fn setup_mock_server() -> MockServer {
    init_test_tracing();
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/index.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(include_str!("../fixtures/hls/live_10.m3u8"))
                .insert_header("Date", "Mon, 01 Jan 2024 00:01:00 GMT"),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/seg10.ts"))
        .and(header("range", "bytes=100-199"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![7u8; 100]))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/slow.ts"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&mock_server)
        .await;

    mock_server
}

fn transport() -> HttpTransport {
    HttpTransport::new(HttpClient::new(Client::builder()).assert_success()).with_retries(1)
}

fn request(server: &MockServer, path: &str, kind: LoadKind) -> LoadRequest {
    let url = Url::parse(&format!("{}{path}", server.uri())).unwrap();
    LoadRequest::new(url, kind)
}

#[tokio::test]
async fn test_transport_reads_date_and_range() -> anyhow::Result<()> {
    let server = setup_mock_server().await;
    let transport = transport();

    let response = transport
        .fetch(&request(&server, "/live/index.m3u8", LoadKind::Manifest))
        .await?;
    assert!(response.body.starts_with(b"#EXTM3U"));
    assert_eq!(
        response.date,
        Some("2024-01-01T00:01:00Z".parse()?)
    );

    let segment = LoadRequest {
        byte_range: Some(ByteRange::new(100, Some(100))),
        ..request(&server, "/live/seg10.ts", LoadKind::Media)
    };
    let response = transport.fetch(&segment).await?;
    assert_eq!(response.body.len(), 100);
    Ok(())
}

#[tokio::test]
async fn test_transport_http_error() {
    let server = setup_mock_server().await;
    let result = transport()
        .fetch(&request(&server, "/live/missing.m3u8", LoadKind::Playlist))
        .await;
    match result {
        Err(IoriError::HttpError(status)) => assert_eq!(status, StatusCode::NOT_FOUND),
        other => panic!("expected a http error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transport_backs_off_between_retries() -> anyhow::Result<()> {
    init_test_tracing();
    // nothing listens on a port that was just released
    let port = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
    let url = Url::parse(&format!("http://127.0.0.1:{port}/live/index.m3u8"))?;

    let transport = HttpTransport::new(HttpClient::new(Client::builder()).assert_success())
        .with_retries(2)
        .with_retry_delay(Duration::from_millis(100));
    let started = std::time::Instant::now();
    let result = transport.fetch(&LoadRequest::new(url, LoadKind::Playlist)).await;

    assert!(matches!(result, Err(IoriError::RequestError(_))));
    // 100ms before the first retry, 200ms before the second
    assert!(started.elapsed() >= Duration::from_millis(300));
    Ok(())
}

#[tokio::test]
async fn test_loader_reports_and_cancels() -> anyhow::Result<()> {
    let server = setup_mock_server().await;
    let (loader, mut events) = Loader::new(transport());

    let playlist = request(&server, "/live/index.m3u8", LoadKind::Playlist);
    let playlist_id = playlist.id;
    loader.start(playlist);
    let event = events.recv().await.assert_success();
    assert_eq!(event.id, playlist_id);
    assert_eq!(event.kind, LoadKind::Playlist);
    assert!(matches!(event.outcome, LoadOutcome::Completed(_)));

    let slow = request(&server, "/live/slow.ts", LoadKind::Media);
    let slow_id = slow.id;
    loader.start(slow);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(loader.running(), 1);
    loader.cancel(slow_id);
    let event = events.recv().await.assert_success();
    assert_eq!(event.id, slow_id);
    assert!(matches!(event.outcome, LoadOutcome::Canceled));
    assert_eq!(loader.running(), 0);
    Ok(())
}

#[tokio::test]
async fn test_tracker_over_http() -> anyhow::Result<()> {
    let server = setup_mock_server().await;
    let (loader, mut events) = Loader::new(transport());
    let url = Url::parse(&format!("{}/live/index.m3u8", server.uri()))?;
    let mut tracker = HlsPlaylistTracker::new(url.clone(), TrackerConfig::default(), SystemClock::shared());

    for request in tracker.poll_loads() {
        loader.start(request);
    }
    let event = events.recv().await.assert_success();
    match event.outcome {
        LoadOutcome::Completed(response) => tracker.on_load_completed(event.id, response),
        LoadOutcome::Failed(e) => tracker.on_load_error(event.id, e),
        LoadOutcome::Canceled => {}
    }

    assert!(tracker.is_live());
    let snapshot = tracker.playlist_snapshot(&url, false).assert_success();
    assert_eq!(snapshot.media_sequence, 10);
    assert_eq!(snapshot.segments[0].url, url.join("seg10.ts")?);
    Ok(())
}

/// Serves fixed bodies without any network.
struct StaticTransport(HashMap<Url, &'static str>);

impl Transport for StaticTransport {
    fn fetch(&self, request: &LoadRequest) -> impl Future<Output = IoriResult<Response>> + Send {
        let result = match self.0.get(&request.url) {
            Some(&body) => Ok(Response {
                url: request.url.clone(),
                body: Bytes::from_static(body.as_bytes()),
                date: None,
            }),
            None => Err(IoriError::HttpError(StatusCode::NOT_FOUND)),
        };
        async move { result }
    }
}

#[test]
fn test_custom_transport() {
    let playlist = crate::url("index.m3u8");
    let transport = StaticTransport(HashMap::from([(
        playlist.clone(),
        include_str!("../fixtures/hls/live_10.m3u8"),
    )]));

    let response = block_on(transport.fetch(&LoadRequest::new(playlist, LoadKind::Manifest))).assert_success();
    assert!(response.body.starts_with(b"#EXTM3U"));
    block_on(transport.fetch(&LoadRequest::new(crate::url("other.m3u8"), LoadKind::Manifest))).assert_error();
}
