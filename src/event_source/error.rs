use std::str::Utf8Error;

use reqwest::StatusCode;
use thiserror::Error;

use crate::event_source::fetch::BoxError;

/// Terminal failures of an [`EventSource`](crate::event_source::client::EventSource).
///
/// Every variant is delivered once through the `error` event and leaves the
/// source closed. None of them trigger a reconnect.
#[derive(Debug, Error)]
pub enum EventSourceError {
    /// The server answered, but not with an event stream.
    #[error("connection rejected: {0}")]
    Connection(#[from] ConnectionError),

    /// The request could not be sent or the body read failed mid-stream.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// A complete line of the stream was not valid UTF-8.
    #[error("invalid utf-8 in event stream: {0}")]
    Decode(#[from] Utf8Error),
}

/// Response-level protocol violations detected before the stream opens.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("response not ok: {status}")]
    Status { status: StatusCode },

    #[error("invalid content type: {}", content_type.as_deref().unwrap_or("<missing>"))]
    InvalidContentType { content_type: Option<String> },
}

/// A recognised field whose value could not be used.
///
/// Recovered locally by the parser: the field is ignored and the stream
/// continues.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed {field} field: {value:?}")]
pub struct MalformedField {
    pub field: &'static str,
    pub value: String,
}
