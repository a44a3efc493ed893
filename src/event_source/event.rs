//! Values delivered to event-source listeners.

use std::sync::Arc;

use crate::event_source::error::EventSourceError;

/// Event type used for frames without an `event:` field.
pub const MESSAGE_EVENT: &str = "message";
pub const OPEN_EVENT: &str = "open";
pub const ERROR_EVENT: &str = "error";
pub const CLOSE_EVENT: &str = "close";

/// An event dispatched by an [`EventSource`](crate::event_source::client::EventSource).
#[derive(Clone, Debug)]
pub enum Event {
    /// The response was accepted and the body is being read.
    Open,
    /// A complete frame, either a plain `message` or a named event.
    Message(MessageEvent),
    /// Terminal failure. The source is closed when this fires.
    Error(ErrorEvent),
    /// The source was closed by its owner. Always the last event.
    Close,
}

impl Event {
    /// Returns the type listeners are keyed by.
    pub fn event_type(&self) -> &str {
        match self {
            Self::Open => OPEN_EVENT,
            Self::Message(message) => &message.event_type,
            Self::Error(_) => ERROR_EVENT,
            Self::Close => CLOSE_EVENT,
        }
    }

    /// Returns the frame payload for message and named events.
    pub fn as_message(&self) -> Option<&MessageEvent> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }
}

/// A dispatched frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    /// `message` unless the frame carried an `event:` field.
    pub event_type: String,
    /// The frame's `data:` values joined by `\n`.
    pub data: String,
    /// Last id seen on this source when the frame was dispatched.
    pub last_event_id: Option<String>,
}

impl MessageEvent {
    pub fn is_message(&self) -> bool {
        self.event_type == MESSAGE_EVENT
    }
}

/// Payload of the terminal `error` event.
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    error: Arc<EventSourceError>,
}

impl ErrorEvent {
    pub(crate) fn new(error: EventSourceError) -> Self {
        Self {
            error: Arc::new(error),
        }
    }

    pub fn error(&self) -> &EventSourceError {
        &self.error
    }
}
