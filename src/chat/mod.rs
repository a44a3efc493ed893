//! Chat service consumer built on the event source.
//!
//! - `client`: HTTP client for the batched and streaming endpoints.
//! - `proto`: request and response payloads.
//! - `transcript`: conversation log with streamed placeholders.
//! - `session`: ties a client to a transcript, one reply at a time.

/// Chat service HTTP client.
pub mod client;
/// Chat payloads.
pub mod proto;
/// Question-and-answer session.
pub mod session;
/// Conversation log.
pub mod transcript;
