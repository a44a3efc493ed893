//! Server-sent events client over streaming HTTP, with a chat consumer.
//!
//! The crate is organized by surface:
//! - `event_source`: fetch-based event source with any method, headers, and
//!   body, incremental frame parsing, and automatic reconnect.
//! - `chat`: client and session helpers for a streaming chat service.
//! - `retry`: shared retry, timeout, and reconnect-delay utilities.

/// Chat service client, payloads, transcript, and session.
pub mod chat;
/// Event source client, parser, and fetch seam.
pub mod event_source;
/// Retry and timeout helpers used across the crate.
pub mod retry;
