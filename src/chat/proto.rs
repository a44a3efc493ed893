use serde::{Deserialize, Serialize};

/// One finished exchange: `(query, response)`. Serialized as a two-element array.
pub type Turn = (String, String);

/// Event type the streaming endpoint sends every payload under.
pub const DELTA_EVENT: &str = "delta";

/// Marker the streaming endpoint puts in `delta` of its terminal payload.
pub const END_OF_STREAM_DELTA: &str = "[EOS]";

/// Body of both `POST /chat` and `POST /stream`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub query: String,
    pub history: Vec<Turn>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>, history: Vec<Turn>) -> Self {
        Self {
            query: query.into(),
            history,
        }
    }
}

/// Answer from the batched `POST /chat` endpoint.
///
/// A failed generation comes back as `success: false` with empty fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatResponse {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub success: bool,
}

/// Payload of a `delta` event on the streaming endpoint.
///
/// Intermediate payloads carry the newest fragment in `delta` and the text so
/// far in `response`. The terminal payload has `finished: true`, the full
/// `response`, and the echoed `query` and `history`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamDelta {
    #[serde(default)]
    pub delta: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Turn>>,
}

/// Plain `{"success": ..}` acknowledgement from the service endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
