//! Server-sent events over a streaming fetch.
//!
//! - `client`: the `EventSource` handle, its builder, and the connection
//!   task that reconnects after a clean end of stream.
//! - `parser`: incremental line buffering and frame assembly.
//! - `fetch`: the streaming request seam and its reqwest implementation.
//! - `listener`: listener registry and convenience slots.

/// Event source handle, options, and connection lifecycle.
pub mod client;
/// Terminal and recoverable error types.
pub mod error;
/// Events delivered to listeners.
pub mod event;
/// Streaming fetch trait, request/response types, and header merging.
pub mod fetch;
/// Listener registry.
pub mod listener;
/// Event stream parser and resume state.
pub mod parser;

pub use client::{
    CloseHandle, EventSource, EventSourceBuilder, EventSourceDefaults, EventSourceOptions,
    ReadyState,
};
pub use error::{ConnectionError, EventSourceError};
pub use event::{ErrorEvent, Event, MessageEvent};
pub use listener::ListenerId;
