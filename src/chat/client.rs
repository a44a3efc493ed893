use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::chat::proto::{ChatRequest, ChatResponse, ServiceStatus};
use crate::event_source::client::{EventSource, EventSourceBuilder, EventSourceOptions};
use crate::event_source::fetch::ReqwestFetch;
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const CHAT_PATH: &str = "chat";
const STREAM_PATH: &str = "stream";
const CLEAR_PATH: &str = "clear";
const SCORE_PATH: &str = "score";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8800/";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChatDefaults;

impl ChatDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    /// Whole answers are generated before `/chat` responds.
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(250);
    pub const JITTER: Duration = Duration::from_millis(100);
}

#[derive(Clone, Debug)]
pub struct ChatClientOptions {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ChatClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: ChatDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ChatDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: ChatDefaults::MAX_ATTEMPTS,
                initial_backoff: ChatDefaults::BACKOFF,
                max_backoff: ChatDefaults::BACKOFF,
                jitter: ChatDefaults::JITTER,
            },
        }
    }
}

impl ChatClientOptions {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// HTTP client for the chat service.
///
/// `chat` asks for a whole answer at once; `stream` prepares an
/// [`EventSource`] that receives the answer as `delta` events.
#[derive(Clone, Debug)]
pub struct ChatClient {
    http: Client,
    base_url: Url,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl ChatClient {
    pub fn new() -> Result<Self, ChatApiError> {
        Self::with_options(ChatClientOptions::default())
    }

    pub fn with_options(options: ChatClientOptions) -> Result<Self, ChatApiError> {
        let base_url = parse_base_url(&options.base_url)?;
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ChatApiError::Transport)?;

        Ok(Self {
            http,
            base_url,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Asks for a complete answer from `POST /chat`.
    ///
    /// A `success: false` envelope is returned as [`ChatApiError::Unanswered`].
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatApiError> {
        validate_query(request)?;
        let endpoint = self.endpoint(CHAT_PATH)?;

        let response: ChatResponse = self
            .send_with_retry(Method::POST, endpoint, Some(request))
            .await?;
        if !response.success {
            return Err(ChatApiError::Unanswered {
                query: request.query.clone(),
            });
        }
        Ok(response)
    }

    /// Prepares a `POST /stream` event source for `request`.
    ///
    /// Listeners are attached to the returned builder before it is opened.
    /// The stream shares this client's connection pool. An answer is one
    /// request, so the source closes instead of reconnecting when the body
    /// ends.
    pub fn stream(&self, request: &ChatRequest) -> Result<EventSourceBuilder, ChatApiError> {
        validate_query(request)?;
        let endpoint = self.endpoint(STREAM_PATH)?;
        let body = serde_json::to_string(request)?;

        let options = EventSourceOptions::default()
            .with_method(Method::POST)
            .with_header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body)
            .with_max_reconnects(Some(0));

        Ok(EventSource::builder(endpoint.as_str())
            .options(options)
            .fetcher(Arc::new(ReqwestFetch::with_client(self.http.clone()))))
    }

    /// `GET /`: whether the service is up.
    pub async fn status(&self) -> Result<ServiceStatus, ChatApiError> {
        let endpoint = self.base_url.clone();
        self.send_with_retry(Method::GET, endpoint, None).await
    }

    /// `GET /clear`: asks the service to release cached model state.
    pub async fn clear(&self) -> Result<ServiceStatus, ChatApiError> {
        let endpoint = self.endpoint(CLEAR_PATH)?;
        self.send_with_retry(Method::GET, endpoint, None).await
    }

    /// `GET /score`: records a rating for the last answer.
    pub async fn score(&self, score: i32) -> Result<ServiceStatus, ChatApiError> {
        let mut endpoint = self.endpoint(SCORE_PATH)?;
        endpoint
            .query_pairs_mut()
            .append_pair("score", &score.to_string());
        self.send_with_retry(Method::GET, endpoint, None).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, ChatApiError> {
        self.base_url
            .join(path)
            .map_err(|err| ChatApiError::InvalidBaseUrl(err.to_string()))
    }

    async fn send_with_retry<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: Url,
        body: Option<&ChatRequest>,
    ) -> Result<T, ChatApiError> {
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |attempt| {
                let method = method.clone();
                let endpoint = endpoint.clone();
                async move { self.send_attempt(method, endpoint, body, attempt).await }
            },
            ChatApiError::is_retryable,
        )
        .await
    }

    async fn send_attempt<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: Url,
        body: Option<&ChatRequest>,
        attempt: usize,
    ) -> Result<T, ChatApiError> {
        debug!(event = "chat_request", method = %method, endpoint = %endpoint, attempt);

        let mut builder = self
            .http
            .request(method, endpoint)
            .timeout(self.attempt_timeout)
            .header(CACHE_CONTROL, "no-cache");
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(ChatApiError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(ChatApiError::Transport)?;

        if !status.is_success() {
            return Err(ChatApiError::HttpStatus {
                status,
                body: summarize_error_body(&text),
            });
        }

        serde_json::from_str(&text).map_err(|err| ChatApiError::Parse(err.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ChatApiError {
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),

    #[error("query is empty")]
    EmptyQuery,

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("service could not answer {query:?}")]
    Unanswered { query: String },

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ChatApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::InvalidBaseUrl(_)
            | Self::EmptyQuery
            | Self::Unanswered { .. }
            | Self::Encode(_)
            | Self::Parse(_) => false,
        }
    }
}

/// Parses the base URL, adding the trailing slash `join` needs to keep the
/// last path segment.
fn parse_base_url(base_url: &str) -> Result<Url, ChatApiError> {
    let mut url =
        Url::parse(base_url).map_err(|err| ChatApiError::InvalidBaseUrl(err.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(ChatApiError::InvalidBaseUrl(base_url.to_string()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn validate_query(request: &ChatRequest) -> Result<(), ChatApiError> {
    if request.query.trim().is_empty() {
        return Err(ChatApiError::EmptyQuery);
    }
    Ok(())
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.detail.or(parsed.error).or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
