//! Streaming fetch primitive the event source is built on.
//!
//! The event source never talks to the network directly: it issues a
//! [`FetchRequest`] through a [`Fetch`] implementation and reads the
//! returned body incrementally. [`ReqwestFetch`] is the production
//! implementation.

use std::fmt;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use tracing::warn;

/// Boxed error used at the fetch seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Response body as a stream of raw chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// Media type an event stream response must declare.
pub const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Header carrying the last seen event id on reconnect.
pub static LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

/// Whether ambient credentials travel with the request.
///
/// Ambient credentials are the ones a client attaches on its own, such as a
/// cookie store. Headers the caller sets explicitly are always sent.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CredentialsMode {
    /// Send no ambient credentials.
    #[default]
    Omit,
    /// Let the client attach its ambient credentials.
    Include,
}

impl CredentialsMode {
    pub fn from_with_credentials(with_credentials: bool) -> Self {
        if with_credentials {
            Self::Include
        } else {
            Self::Omit
        }
    }
}

/// One streaming HTTP request.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub credentials: CredentialsMode,
}

/// Response head plus a lazily read body.
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl FetchResponse {
    /// Returns the declared `Content-Type`, if it is readable text.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A streaming fetch implementation.
pub trait Fetch: Send + Sync + 'static {
    /// Sends the request and resolves once the response head is available.
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, BoxError>>;
}

/// [`Fetch`] backed by a shared [`reqwest::Client`].
///
/// `Omit` requests go through the plain client. `Include` requests go
/// through the credentialed client when one is set, for example a client
/// built with a cookie store.
#[derive(Clone, Debug, Default)]
pub struct ReqwestFetch {
    http: Client,
    credentialed: Option<Client>,
}

impl ReqwestFetch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuses an existing client and its connection pool.
    pub fn with_client(http: Client) -> Self {
        Self {
            http,
            credentialed: None,
        }
    }

    /// Sets the client used for `Include` requests.
    pub fn with_credentialed_client(mut self, http: Client) -> Self {
        self.credentialed = Some(http);
        self
    }

    fn client_for(&self, credentials: CredentialsMode) -> &Client {
        match (credentials, &self.credentialed) {
            (CredentialsMode::Include, Some(credentialed)) => credentialed,
            _ => &self.http,
        }
    }
}

impl Fetch for ReqwestFetch {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, BoxError>> {
        let http = self.client_for(request.credentials).clone();
        Box::pin(async move {
            let FetchRequest {
                url,
                method,
                headers,
                body,
                ..
            } = request;

            let mut builder = http.request(method, url).headers(headers);
            if let Some(body) = body {
                builder = builder.body(body);
            }

            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(BoxError::from))
                .boxed();

            Ok::<_, BoxError>(FetchResponse {
                status,
                headers,
                body,
            })
        })
    }
}

/// Layers the protocol headers over the caller's headers.
///
/// Protocol values win: `Accept` is always the event-stream type and
/// `Last-Event-ID` reflects the source's own state, present only once an id
/// has been seen.
pub fn merge_headers(caller: &HeaderMap, last_event_id: Option<&str>) -> HeaderMap {
    let mut merged = caller.clone();
    merged.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM_MIME));
    merged.remove(&LAST_EVENT_ID);

    if let Some(id) = last_event_id {
        match HeaderValue::from_bytes(id.as_bytes()) {
            Ok(value) => {
                merged.insert(LAST_EVENT_ID.clone(), value);
            }
            Err(_) => warn!(
                event = "event_source_last_event_id_unsendable",
                last_event_id = id
            ),
        }
    }

    merged
}

/// Checks a `Content-Type` value against the event-stream media type.
pub fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|essence| essence.eq_ignore_ascii_case(EVENT_STREAM_MIME))
}
