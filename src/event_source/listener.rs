//! Listener registry with ordered, dual dispatch.
//!
//! Each event goes first to every listener registered for its type, in
//! registration order, and then to the matching convenience slot if one is
//! set. Named events other than `message` have no convenience slot.

use std::fmt;
use std::sync::Arc;

use crate::event_source::event::Event;

/// Shared event handler.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

/// Identifies a registered listener for later removal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

/// Convenience callback slots, one handler each.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slot {
    Open,
    Message,
    Error,
    Close,
}

impl Slot {
    fn for_event(event: &Event) -> Option<Self> {
        match event {
            Event::Open => Some(Self::Open),
            Event::Message(message) if message.is_message() => Some(Self::Message),
            Event::Message(_) => None,
            Event::Error(_) => Some(Self::Error),
            Event::Close => Some(Self::Close),
        }
    }
}

struct Registered {
    id: ListenerId,
    event_type: String,
    handler: Handler,
}

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    /// Set once the connection task has exited; nothing is stored after.
    retired: bool,
    registered: Vec<Registered>,
    on_open: Option<Handler>,
    on_message: Option<Handler>,
    on_error: Option<Handler>,
    on_close: Option<Handler>,
}

impl Listeners {
    pub(crate) fn add(&mut self, event_type: impl Into<String>, handler: Handler) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        if self.retired {
            return id;
        }
        self.registered.push(Registered {
            id,
            event_type: event_type.into(),
            handler,
        });
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.registered.len();
        self.registered.retain(|listener| listener.id != id);
        self.registered.len() != before
    }

    /// Replaces the handler in `slot`; `None` clears it.
    pub(crate) fn set_slot(&mut self, slot: Slot, handler: Option<Handler>) {
        if self.retired {
            return;
        }
        let target = match slot {
            Slot::Open => &mut self.on_open,
            Slot::Message => &mut self.on_message,
            Slot::Error => &mut self.on_error,
            Slot::Close => &mut self.on_close,
        };
        *target = handler;
    }

    /// Snapshot of handlers for `event`, in the order they must run.
    ///
    /// Handlers run outside the registry lock so they may register,
    /// remove, or close the source themselves.
    pub(crate) fn handlers_for(&self, event: &Event) -> Vec<Handler> {
        let event_type = event.event_type();
        let mut handlers: Vec<Handler> = self
            .registered
            .iter()
            .filter(|listener| listener.event_type == event_type)
            .map(|listener| Arc::clone(&listener.handler))
            .collect();

        let slot = Slot::for_event(event).and_then(|slot| match slot {
            Slot::Open => self.on_open.as_ref(),
            Slot::Message => self.on_message.as_ref(),
            Slot::Error => self.on_error.as_ref(),
            Slot::Close => self.on_close.as_ref(),
        });
        handlers.extend(slot.cloned());
        handlers
    }

    /// Drops every handler and refuses new ones.
    pub(crate) fn retire(&mut self) {
        *self = Self {
            next_id: self.next_id,
            retired: true,
            ..Self::default()
        };
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.registered.is_empty()
            && self.on_open.is_none()
            && self.on_message.is_none()
            && self.on_error.is_none()
            && self.on_close.is_none()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("registered", &self.registered.len())
            .field("retired", &self.retired)
            .field("on_open", &self.on_open.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}
