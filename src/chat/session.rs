//! Question-and-answer session over a [`ChatClient`].
//!
//! `ChatSession` owns the transcript and turns each question into either a
//! streamed reply (`ask`) or a batched one (`ask_batched`). The transcript is
//! updated from the event source's listeners as fragments arrive, so it can
//! be read while a reply is still streaming.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::chat::client::{ChatApiError, ChatClient};
use crate::chat::proto::{ChatRequest, StreamDelta, Turn, DELTA_EVENT};
use crate::chat::transcript::{DeltaOutcome, ReplyId, Transcript};
use crate::event_source::event::Event;
use crate::retry::with_timeout;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChatSessionDefaults;

impl ChatSessionDefaults {
    pub const REPLY_TIMEOUT: Duration = Duration::from_secs(300);
}

#[derive(Clone, Debug)]
pub struct ChatSessionOptions {
    /// Longest wait for a streamed reply before it is given up.
    pub reply_timeout: Duration,
    pub greeting: Option<String>,
}

impl Default for ChatSessionOptions {
    fn default() -> Self {
        Self {
            reply_timeout: ChatSessionDefaults::REPLY_TIMEOUT,
            greeting: None,
        }
    }
}

/// How a reply ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplyOutcome {
    /// The final answer arrived.
    Finished { response: String },
    /// The stream or request failed. The transcript shows the apology.
    Failed { reason: String },
    /// The stream closed before a final answer arrived.
    Cancelled,
    /// No final answer within the reply timeout.
    TimedOut,
}

type OutcomeSlot = Arc<Mutex<Option<oneshot::Sender<ReplyOutcome>>>>;

/// Conversation state plus the client used to extend it.
#[derive(Debug)]
pub struct ChatSession {
    client: ChatClient,
    transcript: Arc<Mutex<Transcript>>,
    reply_timeout: Duration,
}

impl ChatSession {
    pub fn new(client: ChatClient) -> Self {
        Self::with_options(client, ChatSessionOptions::default())
    }

    pub fn with_options(client: ChatClient, options: ChatSessionOptions) -> Self {
        let transcript = match options.greeting {
            Some(greeting) => Transcript::with_greeting(greeting),
            None => Transcript::new(),
        };
        Self {
            client,
            transcript: Arc::new(Mutex::new(transcript)),
            reply_timeout: options.reply_timeout,
        }
    }

    pub fn client(&self) -> &ChatClient {
        &self.client
    }

    /// Snapshot of the conversation log.
    pub fn transcript(&self) -> Transcript {
        lock(&self.transcript).clone()
    }

    pub fn history(&self) -> Vec<Turn> {
        lock(&self.transcript).history().to_vec()
    }

    /// Starts the next question without earlier context.
    pub fn clear_history(&self) {
        lock(&self.transcript).clear_history();
    }

    /// Asks `query` over the streaming endpoint and waits for the reply.
    ///
    /// Errors only when the request cannot be built; every outcome after the
    /// stream is opened is reported through [`ReplyOutcome`].
    pub async fn ask(&self, query: &str) -> Result<ReplyOutcome, ChatApiError> {
        let (request, reply) = self.begin(query)?;
        let builder = match self.client.stream(&request) {
            Ok(builder) => builder,
            Err(error) => {
                lock(&self.transcript).fail_reply(reply);
                return Err(error);
            }
        };

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let outcome_tx: OutcomeSlot = Arc::new(Mutex::new(Some(outcome_tx)));
        let closer = builder.close_handle();

        let delta_transcript = Arc::clone(&self.transcript);
        let delta_outcome = Arc::clone(&outcome_tx);
        let error_transcript = Arc::clone(&self.transcript);
        let error_outcome = Arc::clone(&outcome_tx);
        let close_outcome = outcome_tx;

        let source = builder
            .add_event_listener(DELTA_EVENT, move |event| {
                let Some(message) = event.as_message() else {
                    return;
                };
                let delta = match serde_json::from_str::<StreamDelta>(&message.data) {
                    Ok(delta) => delta,
                    Err(error) => {
                        warn!(event = "chat_delta_unparseable", error = %error, data = %message.data);
                        return;
                    }
                };
                if lock(&delta_transcript).apply_delta(reply, &delta) == DeltaOutcome::Finished {
                    closer.close();
                    settle(
                        &delta_outcome,
                        ReplyOutcome::Finished {
                            response: delta.response,
                        },
                    );
                }
            })
            .on_error(move |event| {
                lock(&error_transcript).fail_reply(reply);
                let reason = match event {
                    Event::Error(error) => error.error().to_string(),
                    _ => "stream failed".to_string(),
                };
                settle(&error_outcome, ReplyOutcome::Failed { reason });
            })
            .on_close(move |_| settle(&close_outcome, ReplyOutcome::Cancelled))
            .open();

        let outcome = match with_timeout(self.reply_timeout, outcome_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ReplyOutcome::Cancelled,
            Err(_) => ReplyOutcome::TimedOut,
        };
        source.close();

        if !matches!(outcome, ReplyOutcome::Finished { .. }) {
            lock(&self.transcript).fail_reply(reply);
        }
        log_outcome(&request.query, &outcome);
        Ok(outcome)
    }

    /// Asks `query` over the batched endpoint.
    pub async fn ask_batched(&self, query: &str) -> Result<ReplyOutcome, ChatApiError> {
        let (request, reply) = self.begin(query)?;

        let outcome = match self.client.chat(&request).await {
            Ok(response) => {
                lock(&self.transcript).complete_reply(reply, &response);
                ReplyOutcome::Finished {
                    response: response.response,
                }
            }
            Err(error) => {
                lock(&self.transcript).fail_reply(reply);
                ReplyOutcome::Failed {
                    reason: error.to_string(),
                }
            }
        };
        log_outcome(&request.query, &outcome);
        Ok(outcome)
    }

    /// Records the question and its placeholder, and builds the request
    /// with the history as it was before this question.
    fn begin(&self, query: &str) -> Result<(ChatRequest, ReplyId), ChatApiError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ChatApiError::EmptyQuery);
        }

        let mut transcript = lock(&self.transcript);
        let request = ChatRequest::new(query, transcript.history().to_vec());
        transcript.push_user(query);
        let reply = transcript.begin_reply(query);
        Ok((request, reply))
    }
}

fn lock(transcript: &Mutex<Transcript>) -> MutexGuard<'_, Transcript> {
    transcript.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delivers the first outcome; later ones are dropped.
fn settle(slot: &OutcomeSlot, outcome: ReplyOutcome) {
    let sender = slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(outcome);
    }
}

fn log_outcome(query: &str, outcome: &ReplyOutcome) {
    match outcome {
        ReplyOutcome::Finished { response } => info!(
            event = "chat_reply_finished",
            query,
            response_chars = response.chars().count()
        ),
        ReplyOutcome::Failed { reason } => {
            warn!(event = "chat_reply_failed", query, reason = %reason)
        }
        ReplyOutcome::Cancelled => warn!(event = "chat_reply_cancelled", query),
        ReplyOutcome::TimedOut => warn!(event = "chat_reply_timed_out", query),
    }
}
