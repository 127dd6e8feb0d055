#![allow(dead_code)]

use dropcall::calls::signaling::OfferRecord;
use dropcall::calls::{CallStatus, GatePolicy};
use dropcall::types::call::{EndReason, SessionId};
use dropcall::types::events::{Event, EventHandler};
use dropcall::types::user::{PeerId, PeerSnapshot};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn alice() -> PeerSnapshot {
    PeerSnapshot::new("alice", "Alice")
}

pub fn bob() -> PeerSnapshot {
    PeerSnapshot::new("bob", "Bob").with_avatar("https://example.test/bob.png")
}

/// Test stand-in for the gating collaborator: a blocklist set plus the
/// "currently on the call view" flag.
pub struct StaticGatePolicy {
    blocked: Mutex<HashSet<PeerId>>,
    on_call_view: AtomicBool,
}

impl StaticGatePolicy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blocked: Mutex::new(HashSet::new()),
            on_call_view: AtomicBool::new(false),
        })
    }

    pub fn block(&self, peer: PeerId) {
        self.blocked.lock().unwrap().insert(peer);
    }

    pub fn set_on_call_view(&self, on: bool) {
        self.on_call_view.store(on, Ordering::SeqCst);
    }
}

impl GatePolicy for StaticGatePolicy {
    fn is_blocked(&self, peer: &PeerId) -> bool {
        self.blocked.lock().unwrap().contains(peer)
    }

    fn on_call_view(&self) -> bool {
        self.on_call_view.load(Ordering::SeqCst)
    }
}

/// Collects every dispatched event for later assertions.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventHandler for EventLog {
    fn handle_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn first_incoming(&self) -> Option<(SessionId, OfferRecord)> {
        self.snapshot().into_iter().find_map(|e| match e {
            Event::IncomingCall(incoming) => Some((incoming.session_id, incoming.offer)),
            _ => None,
        })
    }

    pub fn incoming_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| matches!(e, Event::IncomingCall(_)))
            .count()
    }

    pub fn has_status(&self, status: CallStatus) -> bool {
        self.snapshot().iter().any(|e| {
            matches!(e, Event::CallStatusChanged(change) if change.status == status)
        })
    }

    pub fn has_remote_stream(&self) -> bool {
        self.snapshot()
            .iter()
            .any(|e| matches!(e, Event::RemoteStream(_)))
    }

    pub fn ended_reasons(&self) -> Vec<EndReason> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::CallEnded(ended) => Some(ended.reason),
                _ => None,
            })
            .collect()
    }
}

const WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const WAIT_STEP: Duration = Duration::from_millis(10);

/// Poll a condition until it holds or the timeout trips.
pub async fn eventually(check: impl Fn() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if check() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(WAIT_STEP).await;
    }
}

/// Poll an async condition until it holds or the timeout trips.
pub async fn eventually_async<F, Fut>(check: F, what: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(WAIT_STEP).await;
    }
}
