//! Incremental decoding of an event-stream body into frames.
//!
//! Bytes are buffered until a full line is available, so neither a field
//! value nor a multi-byte character is ever split at a chunk boundary.

use std::str::Utf8Error;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::event_source::error::MalformedField;
use crate::event_source::event::{MessageEvent, MESSAGE_EVENT};
use crate::retry::DelayBounds;

const DATA_FIELD: &str = "data:";
const EVENT_FIELD: &str = "event:";
const ID_FIELD: &str = "id:";
const RETRY_FIELD: &str = "retry:";

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Connection state carried from one attempt to the next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeState {
    /// Sent as `Last-Event-ID` on the next attempt.
    pub last_event_id: Option<String>,
    /// Wait applied after a clean end of stream.
    pub reconnect_delay: Duration,
    /// Window server `retry:` values are clamped into.
    pub bounds: DelayBounds,
}

impl ResumeState {
    pub fn new(reconnect_delay: Duration, bounds: DelayBounds) -> Self {
        Self {
            last_event_id: None,
            reconnect_delay: bounds.clamp(reconnect_delay),
            bounds,
        }
    }

    fn apply_retry(&mut self, requested: Duration) {
        let applied = self.bounds.clamp(requested);
        if applied != requested {
            debug!(
                event = "event_source_retry_clamped",
                requested_ms = requested.as_millis() as u64,
                applied_ms = applied.as_millis() as u64
            );
        }
        self.reconnect_delay = applied;
    }
}

/// Parses the value of a `retry:` field.
///
/// Only a positive base-10 integer of milliseconds is accepted.
pub fn parse_retry(value: &str) -> Result<Duration, MalformedField> {
    let malformed = || MalformedField {
        field: "retry",
        value: value.to_string(),
    };

    let digits = value.trim();
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(malformed());
    }

    match digits.parse::<u64>() {
        Ok(0) | Err(_) => Err(malformed()),
        Ok(millis) => Ok(Duration::from_millis(millis)),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Boundary,
    Data(&'a str),
    Event(&'a str),
    Id(&'a str),
    Retry(&'a str),
    Ignored,
}

fn classify(line: &str) -> Line<'_> {
    if line.trim().is_empty() {
        return Line::Boundary;
    }
    if let Some(value) = line.strip_prefix(DATA_FIELD) {
        return Line::Data(value.strip_prefix(' ').unwrap_or(value));
    }
    if let Some(value) = line.strip_prefix(EVENT_FIELD) {
        return Line::Event(value.trim());
    }
    if let Some(value) = line.strip_prefix(ID_FIELD) {
        return Line::Id(value.trim());
    }
    if let Some(value) = line.strip_prefix(RETRY_FIELD) {
        return Line::Retry(value);
    }
    Line::Ignored
}

#[derive(Debug, Default)]
struct LineBuffer {
    pending: BytesMut,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
    bom_checked: bool,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Pops the next complete line without its terminator.
    fn next_line(&mut self) -> Option<BytesMut> {
        if !self.bom_checked {
            if self.pending.len() < BOM.len() && BOM.starts_with(&self.pending) {
                return None;
            }
            if self.pending.starts_with(BOM) {
                self.pending.advance(BOM.len());
            }
            self.bom_checked = true;
        }

        let Some(offset) = self.pending[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
        else {
            self.scanned = self.pending.len();
            return None;
        };
        let newline = self.scanned + offset;
        self.scanned = 0;
        let mut line = self.pending.split_to(newline + 1);
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(newline - 1);
        }
        Some(line)
    }
}

#[derive(Debug, Default)]
struct FrameAccumulator {
    event_type: Option<String>,
    data: String,
    data_lines: usize,
}

impl FrameAccumulator {
    fn push_data(&mut self, value: &str) {
        if self.data_lines > 0 {
            self.data.push('\n');
        }
        self.data.push_str(value);
        self.data_lines += 1;
    }

    fn set_event_type(&mut self, value: &str) {
        self.event_type = (!value.is_empty()).then(|| value.to_string());
    }

    /// Emits the frame and resets for the next one. A boundary with no
    /// fields still yields an empty `message` carrying the current id.
    fn take(&mut self, last_event_id: Option<&str>) -> MessageEvent {
        let frame = std::mem::take(self);
        MessageEvent {
            event_type: frame
                .event_type
                .unwrap_or_else(|| MESSAGE_EVENT.to_string()),
            data: frame.data,
            last_event_id: last_event_id.map(str::to_string),
        }
    }
}

/// Per-attempt parser turning body chunks into dispatched frames.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    lines: LineBuffer,
    frame: FrameAccumulator,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw body chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.lines.push(chunk);
    }

    /// Consumes buffered lines up to the next complete frame.
    ///
    /// `id:` and `retry:` fields update `resume` as they are read. Returns
    /// `Ok(None)` once no complete line is left; the unterminated remainder
    /// stays buffered for the next chunk.
    pub fn next_event(
        &mut self,
        resume: &mut ResumeState,
    ) -> Result<Option<MessageEvent>, Utf8Error> {
        while let Some(raw) = self.lines.next_line() {
            let line = std::str::from_utf8(&raw)?;
            match classify(line) {
                Line::Boundary => {
                    return Ok(Some(self.frame.take(resume.last_event_id.as_deref())));
                }
                Line::Data(value) => self.frame.push_data(value),
                Line::Event(value) => self.frame.set_event_type(value),
                Line::Id(value) => {
                    if !value.contains('\0') {
                        resume.last_event_id = (!value.is_empty()).then(|| value.to_string());
                    }
                }
                Line::Retry(value) => match parse_retry(value) {
                    Ok(delay) => resume.apply_retry(delay),
                    Err(err) => debug!(event = "event_source_retry_ignored", %err),
                },
                Line::Ignored => {}
            }
        }
        Ok(None)
    }
}
