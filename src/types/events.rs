//! Event surface consumed by the embedding application.
//!
//! The excluded UI layer observes this core exclusively through the bus:
//! register an [`EventHandler`], receive every dispatched [`Event`].
//! Dispatch is synchronous; handlers must be cheap and non-blocking.

use crate::calls::CallStatus;
use crate::calls::signaling::OfferRecord;
use crate::media::MediaStream;
use crate::types::call::{EndReason, SessionId};
use serde::Serialize;
use std::sync::{Arc, RwLock};

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

#[derive(Default, Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    /// Returns true if there are any event handlers registered.
    /// Useful for skipping expensive work when no one is listening.
    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    /// An offer passed the incoming gate and awaits accept/reject.
    IncomingCall(IncomingCall),
    /// The pending incoming offer went away (caller cancelled or the
    /// entry was consumed); any surfaced notification should clear.
    IncomingCallCleared,
    /// The active session's status advanced.
    CallStatusChanged(CallStatusChanged),
    /// The remote side's media arrived.
    RemoteStream(RemoteStreamEvent),
    /// The active session is gone; resources are already released.
    CallEnded(CallEnded),
}

#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub session_id: SessionId,
    pub offer: OfferRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStatusChanged {
    pub session_id: SessionId,
    pub status: CallStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteStreamEvent {
    pub session_id: SessionId,
    #[serde(skip)]
    pub stream: MediaStream,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallEnded {
    pub session_id: SessionId,
    pub reason: EndReason,
}
