//! Call session state.

use crate::types::call::{CallKind, CallRole, SessionId};
use crate::types::user::PeerSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Session status. Strictly monotonic: `connecting → connected → ended`,
/// never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Connecting,
    Connected,
    Ended,
}

impl CallStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_ended(self) -> bool {
        matches!(self, Self::Ended)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Connected => 1,
            Self::Ended => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub from: CallStatus,
    pub to: CallStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot move from {:?} to {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// One live call session, owned exclusively by the session manager for
/// its lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub session_id: SessionId,
    pub role: CallRole,
    pub kind: CallKind,
    /// Snapshot taken at session start; later profile edits don't apply.
    pub partner: PeerSnapshot,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new_outgoing(session_id: SessionId, partner: PeerSnapshot, kind: CallKind) -> Self {
        Self::new(session_id, CallRole::Caller, partner, kind)
    }

    pub fn new_incoming(session_id: SessionId, partner: PeerSnapshot, kind: CallKind) -> Self {
        Self::new(session_id, CallRole::Callee, partner, kind)
    }

    fn new(session_id: SessionId, role: CallRole, partner: PeerSnapshot, kind: CallKind) -> Self {
        Self {
            session_id,
            role,
            kind,
            partner,
            status: CallStatus::Connecting,
            started_at: Utc::now(),
            connected_at: None,
        }
    }

    /// Advance the status. Only forward moves are valid; repeating the
    /// current status is rejected too.
    pub fn advance(&mut self, to: CallStatus) -> Result<(), InvalidTransition> {
        if to.rank() <= self.status.rank() {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        if to == CallStatus::Connected {
            self.connected_at = Some(Utc::now());
        }
        self.status = to;
        Ok(())
    }

    /// Seconds since the connection was established, if it ever was.
    pub fn connected_duration_secs(&self) -> Option<u64> {
        self.connected_at.map(|at| {
            Utc::now()
                .signed_duration_since(at)
                .num_seconds()
                .max(0) as u64
        })
    }
}
