use std::{
    collections::HashMap,
    future::Future,
    ops::Deref,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{
    header::{DATE, RANGE},
    Client, ClientBuilder,
};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::{IoriError, IoriResult},
    model::ByteRange,
    tracker::{LoadId, LoadKind, LoadRequest},
};

/// Body of a completed load.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL after redirects.
    pub url: Url,
    pub body: Bytes,
    /// Value of the `Date` header, used for clock synchronization.
    pub date: Option<DateTime<Utc>>,
}

pub trait Transport: Send + Sync + 'static {
    fn fetch(&self, request: &LoadRequest) -> impl Future<Output = IoriResult<Response>> + Send;
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> IoriResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder.cookie_provider(cookies_store.clone()).build()?;

        Ok(Self {
            client,
            cookies_store,
        })
    }

    pub fn add_cookies(&self, cookies: &[String], url: &Url) {
        let Ok(mut lock) = self.cookies_store.lock() else {
            tracing::warn!("Cookie store is poisoned, ignoring cookies");
            return;
        };
        for cookie in cookies {
            if let Err(e) = lock.parse(cookie, url) {
                tracing::warn!(url = %url, "Invalid cookie {cookie}: {e}");
            }
        }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl HttpClient {
    /// A single GET. Non-success statuses become [`IoriError::HttpError`].
    pub async fn get_response(&self, url: Url, byte_range: Option<ByteRange>) -> IoriResult<Response> {
        let mut request = self.client.get(url);
        if let Some(byte_range) = byte_range {
            request = request.header(RANGE, byte_range.to_http_range());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            if let Ok(body) = response.text().await {
                tracing::warn!("Error body: {body}");
            }
            return Err(IoriError::HttpError(status));
        }

        let url = response.url().clone();
        let date = response
            .headers()
            .get(DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|d| d.with_timezone(&Utc));
        let body = response.bytes().await?;
        Ok(Response { url, body, date })
    }
}

/// [`Transport`] over [`HttpClient`], retrying requests that failed before a
/// status was received.
#[derive(Clone)]
pub struct HttpTransport {
    client: HttpClient,
    retries: u32,
    retry_delay: Duration,
}

impl HttpTransport {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Delay before the first retry. It doubles with every further attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, request: &LoadRequest) -> impl Future<Output = IoriResult<Response>> + Send {
        let client = self.client.clone();
        let url = request.url.clone();
        let byte_range = request.byte_range;
        let mut retries = self.retries;
        let mut delay = self.retry_delay;
        async move {
            loop {
                match client.get_response(url.clone(), byte_range).await {
                    Err(IoriError::RequestError(e)) if retries > 0 => {
                        retries -= 1;
                        tracing::warn!(url = %url, "Request failed, retry in {delay:?}. {e}");
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                    result => return result,
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Completed(Response),
    Failed(IoriError),
    Canceled,
}

/// Result of a load started by [`Loader::start`].
#[derive(Debug)]
pub struct LoadEvent {
    pub id: LoadId,
    pub kind: LoadKind,
    pub url: Url,
    pub outcome: LoadOutcome,
    /// Wall time between the start of the request and its outcome.
    pub elapsed: Duration,
}

/// Runs loads on the tokio runtime and reports their outcome on a channel.
pub struct Loader<T> {
    transport: Arc<T>,
    sender: mpsc::UnboundedSender<LoadEvent>,
    running: Arc<Mutex<HashMap<LoadId, CancellationToken>>>,
}

impl<T> Loader<T>
where
    T: Transport,
{
    pub fn new(transport: T) -> (Self, mpsc::UnboundedReceiver<LoadEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let loader = Self {
            transport: Arc::new(transport),
            sender,
            running: Default::default(),
        };
        (loader, receiver)
    }

    pub fn start(&self, request: LoadRequest) {
        let token = CancellationToken::new();
        self.running.lock().insert(request.id, token.clone());

        let transport = self.transport.clone();
        let sender = self.sender.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                _ = token.cancelled() => LoadOutcome::Canceled,
                result = transport.fetch(&request) => match result {
                    Ok(response) => LoadOutcome::Completed(response),
                    Err(e) => LoadOutcome::Failed(e),
                },
            };
            running.lock().remove(&request.id);
            tracing::trace!(id = %request.id, url = %request.url, "Load finished");
            // the receiver is gone when the owner shut down
            _ = sender.send(LoadEvent {
                id: request.id,
                kind: request.kind,
                url: request.url,
                outcome,
                elapsed: started.elapsed(),
            });
        });
    }

    /// Aborts a running load. Its event still arrives, as [`LoadOutcome::Canceled`].
    pub fn cancel(&self, id: LoadId) {
        if let Some(token) = self.running.lock().get(&id) {
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        for token in self.running.lock().values() {
            token.cancel();
        }
    }

    pub fn running(&self) -> usize {
        self.running.lock().len()
    }
}
