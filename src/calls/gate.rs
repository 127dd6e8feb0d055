//! Incoming call gate.
//!
//! Watches a participant's inbox, filters offers through the blocklist,
//! and surfaces at most one pending incoming session at a time. A second
//! simultaneous offer stays invisible until the first entry clears; the
//! inbox is presented as a single-slot view even when several entries
//! physically arrive.

use super::error::CallError;
use super::signaling;
use crate::mailbox::{Mailbox, MailboxError, Subscription};
use crate::types::call::SessionId;
use crate::types::events::{Event, EventBus, IncomingCall};
use crate::types::user::PeerId;
use log::{debug, warn};
use std::sync::{Arc, Mutex};

/// Read-only collaborator answering the two gating questions: is this
/// originator blocked, and is the local participant already on the call
/// view.
pub trait GatePolicy: Send + Sync {
    fn is_blocked(&self, peer: &PeerId) -> bool;
    fn on_call_view(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Nothing surfaced.
    Idle,
    /// One offer surfaced, awaiting accept/reject.
    Pending,
    /// The current first entry came from a blocked originator and is
    /// being auto-rejected.
    Suppressed,
}

pub struct IncomingCallGate {
    inner: Arc<GateInner>,
    subscription: Mutex<Option<Subscription>>,
}

struct GateInner {
    mailbox: Arc<dyn Mailbox>,
    policy: Arc<dyn GatePolicy>,
    events: EventBus,
    local: PeerId,
    view: Mutex<View>,
}

struct View {
    state: GateState,
    pending: Option<SessionId>,
}

impl IncomingCallGate {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        policy: Arc<dyn GatePolicy>,
        events: EventBus,
        local: PeerId,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                mailbox,
                policy,
                events,
                local,
                view: Mutex::new(View {
                    state: GateState::Idle,
                    pending: None,
                }),
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Start watching the local inbox. The subscription only signals that
    /// something changed; each pass re-reads the inbox so late or
    /// reordered notifications converge on the same answer.
    pub fn attach(&self) -> Result<(), MailboxError> {
        let inner = Arc::clone(&self.inner);
        let subscription = self.inner.mailbox.subscribe(
            &signaling::inbox_root(&self.inner.local),
            Arc::new(move |_| {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    inner.evaluate().await;
                });
            }),
        )?;
        *self
            .subscription
            .lock()
            .expect("lock should not be poisoned") = Some(subscription);
        Ok(())
    }

    pub fn detach(&self) {
        if let Some(subscription) = self
            .subscription
            .lock()
            .expect("lock should not be poisoned")
            .take()
        {
            subscription.unsubscribe();
        }
    }

    /// Reject the pending offer: delete its inbox entry. The watcher then
    /// observes the emptied inbox and clears the slot.
    pub async fn reject(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.inner
            .mailbox
            .remove(&signaling::inbox_entry(&self.inner.local, session_id))
            .await?;
        Ok(())
    }

    pub fn state(&self) -> GateState {
        self.inner
            .view
            .lock()
            .expect("lock should not be poisoned")
            .state
    }

    pub fn pending(&self) -> Option<SessionId> {
        self.inner
            .view
            .lock()
            .expect("lock should not be poisoned")
            .pending
            .clone()
    }
}

impl GateInner {
    async fn evaluate(self: Arc<Self>) {
        let root = signaling::inbox_root(&self.local);
        let snapshot = match self.mailbox.read_once(&root).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(target: "Calls/Gate", "inbox read failed, skipping pass: {e}");
                return;
            }
        };

        // Deterministic pick: first entry in key order. Mailbox-assigned
        // keys sort in insertion order, so this is the oldest offer.
        let first = snapshot
            .as_ref()
            .and_then(|v| v.as_object())
            .and_then(|entries| entries.iter().next())
            .map(|(key, value)| (SessionId::new(key.clone()), value.clone()));

        let Some((session_id, value)) = first else {
            self.to_idle();
            return;
        };

        let entry_path = signaling::inbox_entry(&self.local, &session_id);
        let offer = match signaling::decode_offer(&entry_path, &value) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(target: "Calls/Gate", "rejecting undecodable inbox entry: {e}");
                self.set_state(GateState::Suppressed, None);
                if let Err(e) = self.mailbox.remove(&entry_path).await {
                    debug!(target: "Calls/Gate", "failed to drop bad entry: {e}");
                }
                return;
            }
        };

        if self.policy.is_blocked(&offer.from) {
            debug!(
                target: "Calls/Gate",
                "auto-rejecting offer {session_id} from blocked {}", offer.from
            );
            self.set_state(GateState::Suppressed, None);
            if let Err(e) = self.mailbox.remove(&entry_path).await {
                debug!(target: "Calls/Gate", "failed to auto-reject: {e}");
            }
            return;
        }

        if self.policy.on_call_view() {
            // The session in progress owns the call view; nothing is
            // surfaced, including re-notifications for our own entry.
            return;
        }

        let already_pending = {
            let view = self.view.lock().expect("lock should not be poisoned");
            view.state == GateState::Pending && view.pending.as_ref() == Some(&session_id)
        };
        if already_pending {
            return;
        }

        self.set_state(GateState::Pending, Some(session_id.clone()));
        self.events
            .dispatch(&Event::IncomingCall(IncomingCall { session_id, offer }));
    }

    fn to_idle(&self) {
        let was_pending = {
            let mut view = self.view.lock().expect("lock should not be poisoned");
            let was_pending = view.state == GateState::Pending;
            view.state = GateState::Idle;
            view.pending = None;
            was_pending
        };
        if was_pending {
            self.events.dispatch(&Event::IncomingCallCleared);
        }
    }

    fn set_state(&self, state: GateState, pending: Option<SessionId>) {
        let mut view = self.view.lock().expect("lock should not be poisoned");
        view.state = state;
        view.pending = pending;
    }
}
