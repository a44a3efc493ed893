//! Running conversation log fed by chat replies.
//!
//! Each assistant reply starts as an empty placeholder that streamed deltas
//! grow in place. The terminal payload replaces the accumulated text with
//! the final answer and records the exchange in the history sent with the
//! next query. Any failure replaces the placeholder with [`APOLOGY`].

use crate::chat::proto::{ChatResponse, StreamDelta, Turn};

/// Shown in place of a reply that could not be produced.
pub const APOLOGY: &str = "Sorry, the assistant cannot answer your question right now.";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Speaker {
    Assistant,
    User,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyState {
    /// Waiting for the first fragment.
    Pending,
    Streaming,
    Complete,
    Failed,
}

impl ReplyState {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub speaker: Speaker,
    pub text: String,
    pub state: ReplyState,
}

/// Handle to one assistant placeholder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplyId(usize);

/// Result of applying one streamed payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeltaOutcome {
    Progress,
    Finished,
    /// The reply was already settled; nothing changed.
    Ignored,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Transcript {
    entries: Vec<Entry>,
    queries: Vec<(ReplyId, String)>,
    history: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the log with an assistant greeting.
    pub fn with_greeting(greeting: impl Into<String>) -> Self {
        let mut transcript = Self::new();
        transcript.entries.push(Entry {
            speaker: Speaker::Assistant,
            text: greeting.into(),
            state: ReplyState::Complete,
        });
        transcript
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entry(&self, reply: ReplyId) -> Option<&Entry> {
        self.entries.get(reply.0)
    }

    /// Finished exchanges, oldest first.
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Forgets past exchanges; the visible log stays.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.entries.push(Entry {
            speaker: Speaker::User,
            text: text.into(),
            state: ReplyState::Complete,
        });
    }

    /// Adds an empty assistant placeholder answering `query`.
    pub fn begin_reply(&mut self, query: impl Into<String>) -> ReplyId {
        let reply = ReplyId(self.entries.len());
        self.entries.push(Entry {
            speaker: Speaker::Assistant,
            text: String::new(),
            state: ReplyState::Pending,
        });
        self.queries.push((reply, query.into()));
        reply
    }

    pub fn apply_delta(&mut self, reply: ReplyId, delta: &StreamDelta) -> DeltaOutcome {
        let Some(entry) = self.open_entry(reply) else {
            return DeltaOutcome::Ignored;
        };

        if !delta.finished {
            entry.text.push_str(&delta.delta);
            entry.state = ReplyState::Streaming;
            return DeltaOutcome::Progress;
        }

        entry.text.clone_from(&delta.response);
        entry.state = ReplyState::Complete;
        let asked = self.take_query(reply);
        let query = delta.query.clone().unwrap_or(asked);
        self.history.push((query, delta.response.clone()));
        DeltaOutcome::Finished
    }

    /// Fills the placeholder with a batched answer.
    pub fn complete_reply(&mut self, reply: ReplyId, response: &ChatResponse) -> bool {
        let Some(entry) = self.open_entry(reply) else {
            return false;
        };
        entry.text.clone_from(&response.response);
        entry.state = ReplyState::Complete;

        let asked = self.take_query(reply);
        let query = if response.query.is_empty() {
            asked
        } else {
            response.query.clone()
        };
        self.history.push((query, response.response.clone()));
        true
    }

    /// Replaces an unsettled placeholder with [`APOLOGY`].
    pub fn fail_reply(&mut self, reply: ReplyId) -> bool {
        let Some(entry) = self.open_entry(reply) else {
            return false;
        };
        entry.text = APOLOGY.to_string();
        entry.state = ReplyState::Failed;
        self.take_query(reply);
        true
    }

    fn open_entry(&mut self, reply: ReplyId) -> Option<&mut Entry> {
        self.entries
            .get_mut(reply.0)
            .filter(|entry| entry.speaker == Speaker::Assistant && !entry.state.is_settled())
    }

    fn take_query(&mut self, reply: ReplyId) -> String {
        match self.queries.iter().position(|(id, _)| *id == reply) {
            Some(index) => self.queries.swap_remove(index).1,
            None => String::new(),
        }
    }
}
