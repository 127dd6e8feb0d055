//! Typed records and path layout for the signaling store.
//!
//! Every mailbox-resident shape has an explicit schema here, validated at
//! the boundary when read back; nothing downstream touches raw values.
//!
//! Layout:
//!
//! ```text
//! inbox/{recipient}/{session}           offer record (+ answer child)
//! inbox/{recipient}/{session}/answer    answer description
//! candidates/{session}/{role}/{key}     append-only candidate queue
//! callLogs/{owner}/{key}                call log entries
//! ```

use super::error::CallError;
use crate::mailbox::MailboxPath;
use crate::media::{SessionDescription, TransportCandidate};
use crate::types::call::{CallDirection, CallKind, CallRole, SessionId};
use crate::types::user::{PeerId, PeerSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn inbox_root(recipient: &PeerId) -> MailboxPath {
    MailboxPath::new(["inbox", recipient.as_str()])
}

pub fn inbox_entry(recipient: &PeerId, session_id: &SessionId) -> MailboxPath {
    inbox_root(recipient).child(session_id.as_str())
}

pub fn answer_path(recipient: &PeerId, session_id: &SessionId) -> MailboxPath {
    inbox_entry(recipient, session_id).child("answer")
}

pub fn candidates_root(session_id: &SessionId) -> MailboxPath {
    MailboxPath::new(["candidates", session_id.as_str()])
}

pub fn candidate_queue(session_id: &SessionId, role: CallRole) -> MailboxPath {
    candidates_root(session_id).child(role.as_str())
}

pub fn call_logs_root(owner: &PeerId) -> MailboxPath {
    MailboxPath::new(["callLogs", owner.as_str()])
}

pub fn call_log_entry(owner: &PeerId, log_id: &str) -> MailboxPath {
    call_logs_root(owner).child(log_id)
}

/// The offer a caller drops into the callee's inbox. The callee's answer
/// is written as a child of the same entry, so a single removal clears
/// the whole session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferRecord {
    pub kind: CallKind,
    pub from: PeerId,
    pub from_display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_avatar: Option<String>,
    pub offer: SessionDescription,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl OfferRecord {
    /// Snapshot of the caller as carried in the offer.
    pub fn caller_snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.from.clone(),
            display_name: self.from_display_name.clone(),
            avatar: self.from_avatar.clone(),
        }
    }
}

/// One call attempt in a participant's log. Created without a duration;
/// a duration is patched in exactly once if the call connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogRecord {
    pub partner: PeerSnapshot,
    pub kind: CallKind,
    pub direction: CallDirection,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

fn malformed(path: &MailboxPath, err: impl std::fmt::Display) -> CallError {
    CallError::MalformedRecord {
        path: path.to_string(),
        reason: err.to_string(),
    }
}

pub fn decode_offer(path: &MailboxPath, value: &Value) -> Result<OfferRecord, CallError> {
    serde_json::from_value(value.clone()).map_err(|e| malformed(path, e))
}

pub fn decode_answer(path: &MailboxPath, value: &Value) -> Result<SessionDescription, CallError> {
    serde_json::from_value(value.clone()).map_err(|e| malformed(path, e))
}

pub fn decode_candidate(
    path: &MailboxPath,
    value: &Value,
) -> Result<TransportCandidate, CallError> {
    serde_json::from_value(value.clone()).map_err(|e| malformed(path, e))
}

pub fn decode_call_log(path: &MailboxPath, value: &Value) -> Result<CallLogRecord, CallError> {
    serde_json::from_value(value.clone()).map_err(|e| malformed(path, e))
}

pub fn encode<T: Serialize>(record: &T) -> Result<Value, CallError> {
    serde_json::to_value(record).map_err(|e| CallError::MalformedRecord {
        path: String::new(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SdpType;
    use serde_json::json;

    #[test]
    fn test_offer_tolerates_attached_answer() {
        let value = json!({
            "kind": "video",
            "from": "alice",
            "from_display_name": "Alice",
            "offer": {"type": "offer", "sdp": "v=0"},
            "ts": 1000,
            "answer": {"type": "answer", "sdp": "v=0"},
        });
        let record = decode_offer(&MailboxPath::new(["inbox", "bob", "s1"]), &value).unwrap();
        assert_eq!(record.kind, CallKind::Video);
        assert_eq!(record.offer.sdp_type, SdpType::Offer);
        assert!(record.answer.is_some());
        assert_eq!(record.caller_snapshot().display_name, "Alice");
    }

    #[test]
    fn test_malformed_offer_is_rejected_at_boundary() {
        let value = json!({"kind": "video", "from": "alice"});
        let err = decode_offer(&MailboxPath::new(["inbox", "bob", "s1"]), &value);
        assert!(matches!(err, Err(CallError::MalformedRecord { .. })));
    }

    #[test]
    fn test_candidate_queue_paths_are_per_role() {
        let sid = SessionId::new("s1");
        assert_eq!(
            candidate_queue(&sid, CallRole::Caller).to_string(),
            "candidates/s1/caller"
        );
        assert_eq!(
            candidate_queue(&sid, CallRole::Callee).to_string(),
            "candidates/s1/callee"
        );
    }
}
