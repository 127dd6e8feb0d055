//! Call session signaling.
//!
//! Establishes and tears down peer media sessions using the keyed
//! mailbox as the only signaling transport.
//!
//! # Architecture
//!
//! - [`CallSession`] & [`CallStatus`]: per-session state, monotonic
//!   status transitions
//! - [`signaling`]: typed mailbox records and the path layout
//! - [`CallManager`]: orchestrates offer/answer/candidate exchange and
//!   owns the media session for the call's lifetime
//! - [`IncomingCallGate`]: watches the inbox, filters by blocklist,
//!   surfaces at most one pending offer
//! - [`CallLogRecorder`]: appends call-attempt records and reconciles
//!   durations after the fact
//!
//! # Protocol overview
//!
//! The caller allocates a session under the callee's inbox, drops an
//! offer record there, and watches for the answer child. The callee
//! answers in place. Both sides append transport candidates to per-role
//! queues and feed the peer's queue into their media session as entries
//! arrive. Either side ends the call by deleting the session entry; the
//! other side observes the deletion.

mod error;
mod gate;
mod log;
mod manager;
pub mod signaling;
mod state;

pub use self::log::CallLogRecorder;
pub use error::CallError;
pub use gate::{GatePolicy, GateState, IncomingCallGate};
pub use manager::{CallManager, CallManagerConfig};
pub use state::{CallSession, CallStatus, InvalidTransition};
