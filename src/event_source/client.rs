//! `EventSource` lifecycle: connect, open, read, reconnect, close.
//!
//! Each source owns one background task that performs every connection
//! attempt in turn and is the only place events are dispatched from. The
//! handle returned to the caller only reads state, edits listeners, and
//! requests a close.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::event_source::error::{ConnectionError, EventSourceError};
use crate::event_source::event::{ErrorEvent, Event};
use crate::event_source::fetch::{
    is_event_stream, merge_headers, CredentialsMode, Fetch, FetchRequest, FetchResponse,
    ReqwestFetch, LAST_EVENT_ID,
};
use crate::event_source::listener::{Handler, ListenerId, Listeners, Slot};
use crate::event_source::parser::{EventStreamParser, ResumeState};
use crate::retry::DelayBounds;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventSourceDefaults;

impl EventSourceDefaults {
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(5000);
    pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);
    pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
}

/// Request and reconnect settings for an [`EventSource`].
#[derive(Clone, Debug)]
pub struct EventSourceOptions {
    pub method: Method,
    /// Caller headers. `Accept` and `Last-Event-ID` are always overridden.
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub with_credentials: bool,
    /// Delay before the first reconnect, until the server sends `retry:`.
    pub reconnect_delay: Duration,
    pub min_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Reconnects allowed after a clean end of stream; `None` is unlimited.
    /// Once used up, the next clean end closes the source.
    pub max_reconnects: Option<u32>,
}

impl Default for EventSourceOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            with_credentials: false,
            reconnect_delay: EventSourceDefaults::RECONNECT_DELAY,
            min_reconnect_delay: EventSourceDefaults::MIN_RECONNECT_DELAY,
            max_reconnect_delay: EventSourceDefaults::MAX_RECONNECT_DELAY,
            max_reconnects: None,
        }
    }
}

impl EventSourceOptions {
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.with_credentials = with_credentials;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the window server-provided `retry:` values are clamped into.
    pub fn with_reconnect_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_reconnect_delay = min;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_max_reconnects(mut self, max_reconnects: Option<u32>) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    fn delay_bounds(&self) -> DelayBounds {
        DelayBounds::new(self.min_reconnect_delay, self.max_reconnect_delay)
    }
}

/// Connection state as exposed through [`EventSource::ready_state`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

#[derive(Debug)]
struct LifecycleState {
    ready_state: ReadyState,
    close_requested: bool,
}

/// State transitions shared by the handle, close handles, and the driver.
#[derive(Debug)]
struct Lifecycle {
    state: Mutex<LifecycleState>,
    closed_tx: watch::Sender<bool>,
}

impl Lifecycle {
    fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(LifecycleState {
                ready_state: ReadyState::Connecting,
                close_requested: false,
            }),
            closed_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready_state(&self) -> ReadyState {
        self.lock().ready_state
    }

    fn is_closed(&self) -> bool {
        self.ready_state() == ReadyState::Closed
    }

    fn close_requested(&self) -> bool {
        self.lock().close_requested
    }

    /// Moves to `next` unless already closed. Returns whether it moved.
    fn advance(&self, next: ReadyState) -> bool {
        let mut state = self.lock();
        if state.ready_state == ReadyState::Closed {
            return false;
        }
        state.ready_state = next;
        true
    }

    /// Closes on behalf of the owner. Only the first call has an effect.
    fn request_close(&self) -> bool {
        {
            let mut state = self.lock();
            if state.ready_state == ReadyState::Closed {
                return false;
            }
            state.ready_state = ReadyState::Closed;
            state.close_requested = true;
        }
        self.closed_tx.send_replace(true);
        true
    }

    /// Closes because of a terminal error. False if the owner closed first.
    fn fail(&self) -> bool {
        self.advance(ReadyState::Closed)
    }
}

#[derive(Debug)]
struct Shared {
    url: String,
    with_credentials: bool,
    lifecycle: Arc<Lifecycle>,
    listeners: Mutex<Listeners>,
    resume: Mutex<ResumeState>,
}

impl Shared {
    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resume(&self) -> MutexGuard<'_, ResumeState> {
        self.resume.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, event: Event) {
        let handlers = self.listeners().handlers_for(&event);
        for handler in handlers {
            handler(&event);
        }
    }

    /// Dispatches while the source stays open.
    ///
    /// The state is checked before every handler, so a handler that closes
    /// the source stops delivery to the ones after it. Returns `false` once
    /// the source is closed.
    fn dispatch_if_active(&self, event: Event) -> bool {
        let handlers = self.listeners().handlers_for(&event);
        for handler in handlers {
            if self.lifecycle.is_closed() {
                return false;
            }
            handler(&event);
        }
        !self.lifecycle.is_closed()
    }
}

/// Request parts that stay fixed across attempts.
#[derive(Clone, Debug)]
struct RequestTemplate {
    url: String,
    method: Method,
    headers: HeaderMap,
    body: Option<String>,
    credentials: CredentialsMode,
}

impl RequestTemplate {
    fn build(&self, last_event_id: Option<&str>) -> FetchRequest {
        FetchRequest {
            url: self.url.clone(),
            method: self.method.clone(),
            headers: merge_headers(&self.headers, last_event_id),
            body: self.body.clone(),
            credentials: self.credentials,
        }
    }
}

/// Closes an [`EventSource`] from anywhere, including its own listeners.
#[derive(Clone, Debug)]
pub struct CloseHandle {
    lifecycle: Arc<Lifecycle>,
}

impl CloseHandle {
    /// Same as [`EventSource::close`].
    pub fn close(&self) {
        self.lifecycle.request_close();
    }

    pub fn ready_state(&self) -> ReadyState {
        self.lifecycle.ready_state()
    }
}

/// Configures listeners before the first connection attempt starts.
pub struct EventSourceBuilder {
    url: String,
    options: EventSourceOptions,
    fetcher: Option<Arc<dyn Fetch>>,
    lifecycle: Arc<Lifecycle>,
    listeners: Listeners,
}

impl EventSourceBuilder {
    fn new(url: String) -> Self {
        Self {
            url,
            options: EventSourceOptions::default(),
            fetcher: None,
            lifecycle: Arc::new(Lifecycle::new()),
            listeners: Listeners::default(),
        }
    }

    pub fn options(mut self, options: EventSourceOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the default reqwest-backed fetch.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetch>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn add_event_listener<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners.add(event_type, Arc::new(handler));
        self
    }

    pub fn on_open<F>(self, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.slot(Slot::Open, Arc::new(handler))
    }

    pub fn on_message<F>(self, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.slot(Slot::Message, Arc::new(handler))
    }

    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.slot(Slot::Error, Arc::new(handler))
    }

    pub fn on_close<F>(self, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.slot(Slot::Close, Arc::new(handler))
    }

    fn slot(mut self, slot: Slot, handler: Handler) -> Self {
        self.listeners.set_slot(slot, Some(handler));
        self
    }

    /// Handle for closing the source from inside its own listeners.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }

    /// Spawns the connection task and returns the source.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn open(self) -> EventSource {
        let Self {
            url,
            options,
            fetcher,
            lifecycle,
            listeners,
        } = self;

        let fetcher = fetcher.unwrap_or_else(|| Arc::new(ReqwestFetch::new()));
        let resume = ResumeState::new(options.reconnect_delay, options.delay_bounds());
        let max_reconnects = options.max_reconnects;
        let template = RequestTemplate {
            url: url.clone(),
            method: options.method,
            headers: options.headers,
            body: options.body,
            credentials: CredentialsMode::from_with_credentials(options.with_credentials),
        };
        let shared = Arc::new(Shared {
            url,
            with_credentials: options.with_credentials,
            lifecycle,
            listeners: Mutex::new(listeners),
            resume: Mutex::new(resume),
        });

        tokio::spawn(event_source_driver(
            Arc::clone(&shared),
            fetcher,
            template,
            max_reconnects,
        ));

        EventSource { shared }
    }
}

/// A server-sent events client over a streaming fetch.
///
/// Reconnects after a clean end of stream, waiting the current reconnect
/// delay and resending the last seen id. Any failure is terminal: one
/// `error` event fires and the source stays closed. Dropping the source
/// closes it.
#[must_use = "dropping an EventSource closes it"]
#[derive(Debug)]
pub struct EventSource {
    shared: Arc<Shared>,
}

impl EventSource {
    /// Opens a source with the default fetch.
    ///
    /// Listeners added after this call may miss the first events; use
    /// [`EventSource::builder`] to register them up front.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn open(url: impl Into<String>, options: EventSourceOptions) -> Self {
        Self::builder(url).options(options).open()
    }

    pub fn builder(url: impl Into<String>) -> EventSourceBuilder {
        EventSourceBuilder::new(url.into())
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.lifecycle.ready_state()
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn with_credentials(&self) -> bool {
        self.shared.with_credentials
    }

    /// Id that will be sent as `Last-Event-ID` on the next attempt.
    pub fn last_event_id(&self) -> Option<String> {
        self.shared.resume().last_event_id.clone()
    }

    /// Wait applied before the next reconnect.
    pub fn reconnect_delay(&self) -> Duration {
        self.shared.resume().reconnect_delay
    }

    pub fn add_event_listener<F>(&self, event_type: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.listeners().add(event_type, Arc::new(handler))
    }

    /// Returns whether the listener was still registered.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners().remove(id)
    }

    pub fn on_open<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared
            .listeners()
            .set_slot(Slot::Open, Some(Arc::new(handler)));
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared
            .listeners()
            .set_slot(Slot::Message, Some(Arc::new(handler)));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared
            .listeners()
            .set_slot(Slot::Error, Some(Arc::new(handler)));
    }

    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared
            .listeners()
            .set_slot(Slot::Close, Some(Arc::new(handler)));
    }

    /// Closes the source. Idempotent.
    ///
    /// The state is `Closed` when this returns. The in-flight request or
    /// pending reconnect is cancelled and a single `close` event is
    /// dispatched from the connection task; nothing is dispatched after it.
    pub fn close(&self) {
        self.shared.lifecycle.request_close();
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            lifecycle: Arc::clone(&self.shared.lifecycle),
        }
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.shared.lifecycle.request_close();
    }
}

enum AttemptOutcome {
    /// The body ended without error.
    Ended,
    /// The owner closed the source.
    Closed,
}

async fn event_source_driver(
    shared: Arc<Shared>,
    fetcher: Arc<dyn Fetch>,
    template: RequestTemplate,
    max_reconnects: Option<u32>,
) {
    let mut closed_rx = shared.lifecycle.closed_tx.subscribe();
    let mut attempt: u64 = 0;

    loop {
        if !shared.lifecycle.advance(ReadyState::Connecting) {
            break;
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = wait_closed(&mut closed_rx) => Ok(AttemptOutcome::Closed),
            outcome = run_attempt(&shared, fetcher.as_ref(), &template, attempt) => outcome,
        };

        match outcome {
            Ok(AttemptOutcome::Closed) => break,
            Ok(AttemptOutcome::Ended) => {
                let reconnects = attempt - 1;
                if max_reconnects.is_some_and(|max| reconnects >= u64::from(max)) {
                    info!(
                        event = "event_source_reconnects_exhausted",
                        url = %template.url,
                        attempt
                    );
                    shared.lifecycle.request_close();
                    break;
                }
                if !shared.lifecycle.advance(ReadyState::Connecting) {
                    break;
                }
                let delay = shared.resume().reconnect_delay;
                info!(
                    event = "event_source_reconnect_scheduled",
                    url = %template.url,
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
                tokio::select! {
                    biased;
                    _ = wait_closed(&mut closed_rx) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => {
                if shared.lifecycle.fail() {
                    warn!(
                        event = "event_source_failed",
                        url = %template.url,
                        attempt,
                        error = %error
                    );
                    shared.dispatch(Event::Error(ErrorEvent::new(error)));
                }
                break;
            }
        }
    }

    if shared.lifecycle.close_requested() {
        debug!(event = "event_source_closed", url = %template.url, attempt);
        shared.dispatch(Event::Close);
    }
    shared.listeners().retire();
}

async fn wait_closed(closed_rx: &mut watch::Receiver<bool>) {
    let _ = closed_rx.wait_for(|closed| *closed).await;
}

async fn run_attempt(
    shared: &Shared,
    fetcher: &dyn Fetch,
    template: &RequestTemplate,
    attempt: u64,
) -> Result<AttemptOutcome, EventSourceError> {
    let request = {
        let resume = shared.resume();
        template.build(resume.last_event_id.as_deref())
    };
    debug!(
        event = "event_source_connecting",
        url = %template.url,
        attempt,
        has_last_event_id = request.headers.contains_key(&LAST_EVENT_ID)
    );

    let response = fetcher
        .fetch(request)
        .await
        .map_err(EventSourceError::Transport)?;
    check_response(&response)?;

    if !shared.lifecycle.advance(ReadyState::Open) || !shared.dispatch_if_active(Event::Open) {
        return Ok(AttemptOutcome::Closed);
    }
    debug!(event = "event_source_open", url = %template.url, attempt);

    let mut parser = EventStreamParser::new();
    let mut body = response.body;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(EventSourceError::Transport)?;
        parser.push(&chunk);
        loop {
            let next = parser.next_event(&mut shared.resume())?;
            let Some(message) = next else {
                break;
            };
            if !shared.dispatch_if_active(Event::Message(message)) {
                return Ok(AttemptOutcome::Closed);
            }
        }
    }

    Ok(AttemptOutcome::Ended)
}

fn check_response(response: &FetchResponse) -> Result<(), ConnectionError> {
    if !response.status.is_success() {
        return Err(ConnectionError::Status {
            status: response.status,
        });
    }

    match response.content_type() {
        Some(content_type) if is_event_stream(content_type) => Ok(()),
        content_type => Err(ConnectionError::InvalidContentType {
            content_type: content_type.map(str::to_string),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use futures_util::stream::{self, StreamExt};
    use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
    use reqwest::StatusCode;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Instant};

    use super::{EventSource, EventSourceOptions, ReadyState};
    use crate::event_source::error::{ConnectionError, EventSourceError};
    use crate::event_source::event::Event;
    use crate::event_source::fetch::{
        BoxError, ByteStream, Fetch, FetchRequest, FetchResponse, LAST_EVENT_ID,
    };

    enum Body {
        Chunks(Vec<&'static str>),
        ChunksThenError(Vec<&'static str>),
        Raw(&'static [u8]),
        Pending,
    }

    struct Scripted {
        status: StatusCode,
        content_type: Option<&'static str>,
        body: Body,
    }

    impl Scripted {
        fn stream(chunks: Vec<&'static str>) -> Self {
            Self {
                status: StatusCode::OK,
                content_type: Some("text/event-stream"),
                body: Body::Chunks(chunks),
            }
        }
    }

    /// Serves scripted responses in order and records every request.
    #[derive(Default)]
    struct ScriptedFetch {
        responses: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<(Instant, FetchRequest)>>,
    }

    impl ScriptedFetch {
        fn new(responses: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::default(),
            })
        }

        fn requests(&self) -> Vec<(Instant, FetchRequest)> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    impl Fetch for ScriptedFetch {
        fn fetch(
            &self,
            request: FetchRequest,
        ) -> BoxFuture<'static, Result<FetchResponse, BoxError>> {
            self.requests
                .lock()
                .expect("requests lock")
                .push((Instant::now(), request));
            let next = self.responses.lock().expect("responses lock").pop_front();

            Box::pin(async move {
                // Once the script runs out, further attempts hang.
                let Some(scripted) = next else {
                    return std::future::pending().await;
                };

                let mut headers = HeaderMap::new();
                if let Some(content_type) = scripted.content_type {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                }
                let body: ByteStream = match scripted.body {
                    Body::Chunks(chunks) => stream::iter(chunks)
                        .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                        .boxed(),
                    Body::ChunksThenError(chunks) => stream::iter(chunks)
                        .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                        .chain(stream::once(async {
                            Err(BoxError::from(io::Error::new(
                                io::ErrorKind::ConnectionReset,
                                "connection reset",
                            )))
                        }))
                        .boxed(),
                    Body::Raw(bytes) => stream::iter([Ok(Bytes::from_static(bytes))]).boxed(),
                    Body::Pending => stream::pending().boxed(),
                };

                Ok(FetchResponse {
                    status: scripted.status,
                    headers,
                    body,
                })
            })
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Seen {
        Open,
        Message(String, String, Option<String>),
        Error(String),
        Close,
    }

    fn record(event: &Event) -> Seen {
        match event {
            Event::Open => Seen::Open,
            Event::Message(message) => Seen::Message(
                message.event_type.clone(),
                message.data.clone(),
                message.last_event_id.clone(),
            ),
            Event::Error(error) => Seen::Error(error.error().to_string()),
            Event::Close => Seen::Close,
        }
    }

    fn open_recorded(
        fetcher: Arc<ScriptedFetch>,
        options: EventSourceOptions,
        named: &[&str],
    ) -> (EventSource, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut builder = EventSource::builder("http://chat.test/stream")
            .options(options)
            .fetcher(fetcher);
        for event_type in ["open", "message", "error", "close"]
            .iter()
            .chain(named.iter())
        {
            let tx = tx.clone();
            builder = builder.add_event_listener(*event_type, move |event| {
                let _ = tx.send(record(event));
            });
        }
        (builder.open(), rx)
    }

    async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn message(data: &str, id: Option<&str>) -> Seen {
        Seen::Message("message".to_string(), data.to_string(), id.map(str::to_string))
    }

    #[tokio::test(start_paused = true)]
    async fn open_precedes_messages_and_named_events() {
        let fetcher = ScriptedFetch::new(vec![Scripted::stream(vec![
            "event: delta\ndata: {\"delta\":\"hi\"}\n\n",
            "data: a\ndata: b\n\n",
        ])]);
        let (source, mut rx) = open_recorded(fetcher, EventSourceOptions::default(), &["delta"]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(
            next_seen(&mut rx).await,
            Seen::Message("delta".to_string(), "{\"delta\":\"hi\"}".to_string(), None)
        );
        assert_eq!(next_seen(&mut rx).await, message("a\nb", None));
        assert_eq!(source.url(), "http://chat.test/stream");
        assert!(!source.with_credentials());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_end_reconnects_after_default_delay_without_last_event_id() {
        let fetcher = ScriptedFetch::new(vec![
            Scripted::stream(vec!["data: hello\n\n"]),
            Scripted::stream(vec!["data: again\n\n"]),
        ]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(next_seen(&mut rx).await, message("hello", None));
        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(next_seen(&mut rx).await, message("again", None));

        let requests = fetcher.requests();
        assert!(requests.len() >= 2);
        let waited = requests[1].0 - requests[0].0;
        assert!(waited >= Duration::from_millis(5000), "waited {waited:?}");
        assert!(requests[1].1.headers.get(&LAST_EVENT_ID).is_none());
        assert_eq!(requests[1].1.headers[ACCEPT], "text/event-stream");
        drop(source);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_uses_server_retry_and_last_event_id() {
        let fetcher = ScriptedFetch::new(vec![
            Scripted::stream(vec!["retry: 3000\nid: 42\ndata: hi\n\n"]),
            Scripted::stream(vec![]),
        ]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(next_seen(&mut rx).await, message("hi", Some("42")));
        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(source.last_event_id().as_deref(), Some("42"));
        assert_eq!(source.reconnect_delay(), Duration::from_millis(3000));

        let requests = fetcher.requests();
        let waited = requests[1].0 - requests[0].0;
        assert!(waited >= Duration::from_millis(3000), "waited {waited:?}");
        assert!(waited < Duration::from_millis(5000), "waited {waited:?}");
        assert_eq!(requests[1].1.headers[&LAST_EVENT_ID], "42");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_retry_keeps_previous_delay() {
        let fetcher = ScriptedFetch::new(vec![
            Scripted::stream(vec!["retry: 3000\n\nretry: abc\nretry: 0\ndata: x\n\n"]),
            Scripted::stream(vec![]),
        ]);
        let (_source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(next_seen(&mut rx).await, message("", None));
        assert_eq!(next_seen(&mut rx).await, message("x", None));
        assert_eq!(next_seen(&mut rx).await, Seen::Open);

        let requests = fetcher.requests();
        let waited = requests[1].0 - requests[0].0;
        assert!(waited >= Duration::from_millis(3000), "waited {waited:?}");
        assert!(waited < Duration::from_millis(5000), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn comment_only_frame_dispatches_empty_message_with_last_id() {
        let fetcher = ScriptedFetch::new(vec![Scripted {
            status: StatusCode::OK,
            content_type: Some("text/event-stream"),
            body: Body::Chunks(vec!["id: 42\n\n", ": keep-alive\n\n"]),
        }]);
        let (_source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(next_seen(&mut rx).await, message("", Some("42")));
        assert_eq!(next_seen(&mut rx).await, message("", Some("42")));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_end_closes_once_reconnects_are_used_up() {
        let fetcher = ScriptedFetch::new(vec![
            Scripted::stream(vec!["data: one\n\n"]),
            Scripted::stream(vec!["data: two\n\n"]),
            Scripted::stream(vec!["data: three\n\n"]),
        ]);
        let options = EventSourceOptions::default().with_max_reconnects(Some(1));
        let (source, mut rx) = open_recorded(Arc::clone(&fetcher), options, &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(next_seen(&mut rx).await, message("one", None));
        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(next_seen(&mut rx).await, message("two", None));
        assert_eq!(next_seen(&mut rx).await, Seen::Close);
        assert_eq!(source.ready_state(), ReadyState::Closed);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.requests().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_status_is_terminal() {
        let fetcher = ScriptedFetch::new(vec![Scripted {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            content_type: Some("text/event-stream"),
            body: Body::Chunks(vec![]),
        }]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        match next_seen(&mut rx).await {
            Seen::Error(message) => assert!(message.contains("500"), "{message}"),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(source.ready_state(), ReadyState::Closed);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.requests().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_content_type_is_an_error_without_open() {
        let fetcher = ScriptedFetch::new(vec![Scripted {
            status: StatusCode::OK,
            content_type: Some("text/plain"),
            body: Body::Chunks(vec!["data: ignored\n\n"]),
        }]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(
            next_seen(&mut rx).await,
            Seen::Error("connection rejected: invalid content type: text/plain".to_string())
        );
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(fetcher.requests().len(), 1);

        // Closing after a terminal error emits nothing.
        source.close();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_content_type_is_an_error_without_open() {
        let fetcher = ScriptedFetch::new(vec![Scripted {
            status: StatusCode::OK,
            content_type: None,
            body: Body::Chunks(vec!["data: ignored\n\n"]),
        }]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(
            next_seen(&mut rx).await,
            Seen::Error("connection rejected: invalid content type: <missing>".to_string())
        );
        assert_eq!(source.ready_state(), ReadyState::Closed);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_added_after_a_terminal_error_are_dropped() {
        let fetcher = ScriptedFetch::new(vec![Scripted {
            status: StatusCode::SERVICE_UNAVAILABLE,
            content_type: None,
            body: Body::Chunks(vec![]),
        }]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert!(matches!(next_seen(&mut rx).await, Seen::Error(_)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(source.shared.listeners().is_empty());

        let (late_tx, mut late_rx) = mpsc::unbounded_channel();
        let id = source.add_event_listener("close", {
            let late_tx = late_tx.clone();
            move |event| {
                let _ = late_tx.send(record(event));
            }
        });
        source.on_close(move |event| {
            let _ = late_tx.send(record(event));
        });
        assert!(source.shared.listeners().is_empty());
        assert!(!source.remove_event_listener(id));

        source.close();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(late_rx.try_recv().is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_mid_stream_is_terminal() {
        let fetcher = ScriptedFetch::new(vec![Scripted {
            status: StatusCode::OK,
            content_type: Some("text/event-stream; charset=utf-8"),
            body: Body::ChunksThenError(vec!["data: partial\n\n", "data: lost"]),
        }]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(next_seen(&mut rx).await, message("partial", None));
        assert_eq!(
            next_seen(&mut rx).await,
            Seen::Error("transport error: connection reset".to_string())
        );
        assert_eq!(source.ready_state(), ReadyState::Closed);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_utf8_is_terminal() {
        let fetcher = ScriptedFetch::new(vec![Scripted {
            status: StatusCode::OK,
            content_type: Some("text/event-stream"),
            body: Body::Raw(b"data: ok\n\ndata: \xFF\n\n"),
        }]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(next_seen(&mut rx).await, message("ok", None));
        match next_seen(&mut rx).await {
            Seen::Error(message) => assert!(message.starts_with("invalid utf-8"), "{message}"),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(source.ready_state(), ReadyState::Closed);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_before_connect_emits_only_close() {
        let fetcher = ScriptedFetch::new(vec![Scripted::stream(vec!["data: never\n\n"])]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        source.close();
        source.close();
        assert_eq!(source.ready_state(), ReadyState::Closed);

        assert_eq!(next_seen(&mut rx).await, Seen::Close);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_through_builder_handle_before_open() {
        let fetcher = ScriptedFetch::new(vec![Scripted::stream(vec!["data: never\n\n"])]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let builder = EventSource::builder("http://chat.test/stream").fetcher(fetcher.clone());
        builder.close_handle().close();
        let _source = builder
            .add_event_listener("close", move |event| {
                let _ = tx.send(record(event));
            })
            .open();

        assert_eq!(next_seen(&mut rx).await, Seen::Close);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_reconnect_delay_prevents_reopen() {
        let fetcher = ScriptedFetch::new(vec![
            Scripted::stream(vec!["id: 42\ndata: hi\n\n"]),
            Scripted::stream(vec!["data: too late\n\n"]),
        ]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(next_seen(&mut rx).await, message("hi", Some("42")));

        // Let the driver observe the end of stream and start waiting.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(source.ready_state(), ReadyState::Connecting);
        source.close();

        assert_eq!(next_seen(&mut rx).await, Seen::Close);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_reading_cancels_and_closes_once() {
        let fetcher = ScriptedFetch::new(vec![Scripted {
            status: StatusCode::OK,
            content_type: Some("text/event-stream"),
            body: Body::Pending,
        }]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert_eq!(source.ready_state(), ReadyState::Open);
        source.close();

        assert_eq!(next_seen(&mut rx).await, Seen::Close);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_from_listener_stops_remaining_frames() {
        let fetcher = ScriptedFetch::new(vec![Scripted::stream(vec![
            "data: first\n\ndata: second\n\n",
        ])]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let builder = EventSource::builder("http://chat.test/stream").fetcher(fetcher);
        let closer = builder.close_handle();
        let message_tx = tx.clone();
        let _source = builder
            .add_event_listener("message", move |event| {
                let _ = message_tx.send(record(event));
                closer.close();
            })
            .add_event_listener("close", move |event| {
                let _ = tx.send(record(event));
            })
            .open();

        assert_eq!(next_seen(&mut rx).await, message("first", None));
        assert_eq!(next_seen(&mut rx).await, Seen::Close);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_in_a_listener_skips_later_handlers_for_the_same_event() {
        let fetcher = ScriptedFetch::new(vec![Scripted::stream(vec!["data: only\n\n"])]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let builder = EventSource::builder("http://chat.test/stream").fetcher(fetcher);
        let closer = builder.close_handle();
        let first_tx = tx.clone();
        let second_tx = tx.clone();
        let slot_tx = tx.clone();
        let _source = builder
            .add_event_listener("message", move |_| {
                let _ = first_tx.send("first".to_string());
                closer.close();
            })
            .add_event_listener("message", move |_| {
                let _ = second_tx.send("second".to_string());
            })
            .on_message(move |_| {
                let _ = slot_tx.send("slot".to_string());
            })
            .on_close(move |_| {
                let _ = tx.send("close".to_string());
            })
            .open();

        let mut seen = Vec::new();
        while let Ok(Some(name)) = timeout(Duration::from_secs(60), rx.recv()).await {
            seen.push(name);
        }
        assert_eq!(seen, ["first", "close"]);
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_registered_on_a_live_source_receive_later_events() {
        let fetcher = ScriptedFetch::new(vec![Scripted::stream(vec![
            "event: delta\ndata: d\n\n",
            "data: m\n\n",
        ])]);
        let source = EventSource::builder("http://chat.test/stream")
            .fetcher(fetcher)
            .open();

        // The driver has not run yet on the paused current-thread runtime.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let delta_tx = tx.clone();
        source.add_event_listener("delta", move |event| {
            let _ = delta_tx.send(format!("delta:{}", record_data(event)));
        });
        let removed_tx = tx.clone();
        let removed = source.add_event_listener("message", move |_| {
            let _ = removed_tx.send("removed".to_string());
        });
        let open_tx = tx.clone();
        source.on_open(move |_| {
            let _ = open_tx.send("open".to_string());
        });
        source.on_message(move |event| {
            let _ = tx.send(format!("message:{}", record_data(event)));
        });
        assert!(source.remove_event_listener(removed));
        assert!(!source.remove_event_listener(removed));

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let name = timeout(Duration::from_secs(60), rx.recv())
                .await
                .expect("timed out")
                .expect("listener channel open");
            seen.push(name);
        }
        assert_eq!(seen, ["open", "delta:d", "message:m"]);
    }

    fn record_data(event: &Event) -> String {
        event
            .as_message()
            .map(|message| message.data.clone())
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_source_closes_it() {
        let fetcher = ScriptedFetch::new(vec![Scripted {
            status: StatusCode::OK,
            content_type: Some("text/event-stream"),
            body: Body::Pending,
        }]);
        let (source, mut rx) =
            open_recorded(Arc::clone(&fetcher), EventSourceOptions::default(), &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        drop(source);
        assert_eq!(next_seen(&mut rx).await, Seen::Close);
    }

    #[tokio::test(start_paused = true)]
    async fn convenience_slots_fire_after_listeners() {
        let fetcher = ScriptedFetch::new(vec![Scripted::stream(vec!["data: x\n\n"])]);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let listener_order = Arc::clone(&order);
        let slot_order = Arc::clone(&order);
        let _source = EventSource::builder("http://chat.test/stream")
            .fetcher(fetcher)
            .on_message(move |_| {
                slot_order.lock().expect("order lock").push("slot");
                let _ = done_tx.send(());
            })
            .add_event_listener("message", move |_| {
                listener_order.lock().expect("order lock").push("listener");
            })
            .open();

        timeout(Duration::from_secs(60), done_rx.recv())
            .await
            .expect("timed out")
            .expect("slot fired");
        assert_eq!(*order.lock().expect("order lock"), ["listener", "slot"]);
    }

    #[tokio::test(start_paused = true)]
    async fn request_carries_caller_options() {
        let fetcher = ScriptedFetch::new(vec![Scripted::stream(vec![])]);
        let options = EventSourceOptions::default()
            .with_method(reqwest::Method::POST)
            .with_body("{\"query\":\"hi\"}")
            .with_header(ACCEPT, HeaderValue::from_static("application/json"))
            .with_credentials(true);
        let (source, mut rx) = open_recorded(Arc::clone(&fetcher), options, &[]);

        assert_eq!(next_seen(&mut rx).await, Seen::Open);
        assert!(source.with_credentials());

        let (_, request) = fetcher.requests().remove(0);
        assert_eq!(request.method, reqwest::Method::POST);
        assert_eq!(request.body.as_deref(), Some("{\"query\":\"hi\"}"));
        assert_eq!(request.headers[ACCEPT], "text/event-stream");
        assert_eq!(
            request.credentials,
            crate::event_source::fetch::CredentialsMode::Include
        );
    }

    #[test]
    fn connection_error_maps_into_event_source_error() {
        let error: EventSourceError = ConnectionError::Status {
            status: StatusCode::BAD_GATEWAY,
        }
        .into();
        assert!(matches!(error, EventSourceError::Connection(_)));
    }
}
