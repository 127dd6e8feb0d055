//! Peer call sessions signaled through a store-and-forward mailbox.
//!
//! No signaling server holds a socket to anyone: offers, answers, and
//! transport candidates travel as eventually-delivered key-value events
//! through a shared subscribable store. The crate negotiates sessions
//! over that store, gates incoming offers against a blocklist, tracks
//! presence off link liveness, and reconciles call durations into a
//! persisted log after the fact. The media engine itself is a pluggable
//! capability; an in-process loopback engine ships for tests and demos.

pub mod calls;
pub mod mailbox;
pub mod media;
pub mod presence;
pub mod types;

pub use calls::{
    CallError, CallLogRecorder, CallManager, CallManagerConfig, CallSession, CallStatus,
    GatePolicy, GateState, IncomingCallGate,
};
pub use mailbox::{Mailbox, MailboxError, MailboxPath, MemoryMailbox};
pub use presence::PresenceTracker;
