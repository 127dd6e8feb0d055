//! Call-related error types.

use crate::mailbox::MailboxError;
use crate::media::MediaError;
use crate::types::call::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    /// Permission refused or device unavailable; aborts only the
    /// attempted action.
    #[error("media acquisition denied: {0}")]
    MediaAcquisitionDenied(String),

    /// The signaling store cannot be reached; non-retryable for the
    /// current attempt.
    #[error("signaling transport unavailable: {0}")]
    TransportUnavailable(#[from] MailboxError),

    /// A description arrived in a state that cannot use it; the payload
    /// is discarded and the session continues if otherwise healthy.
    #[error("negotiation conflict: {0}")]
    NegotiationConflict(String),

    /// An event addressed a session that is already torn down.
    #[error("event for stale session {0}")]
    StaleSession(SessionId),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("a call session is already active")]
    SessionActive,

    #[error("no active call session")]
    NoActiveSession,

    #[error("malformed signaling record at {path}: {reason}")]
    MalformedRecord { path: String, reason: String },

    #[error("media session error: {0}")]
    Media(String),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::AcquisitionDenied(reason) => Self::MediaAcquisitionDenied(reason),
            other => Self::Media(other.to_string()),
        }
    }
}
