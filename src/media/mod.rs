//! Media transport capability.
//!
//! The actual capture/codec/transport engine is an external collaborator;
//! this module defines the seam the session manager drives: acquire local
//! media, create a per-call session, exchange descriptions and transport
//! candidates, observe connectivity and remote tracks. The manager owns
//! the session and its tracks exclusively for the call's lifetime.

pub mod loopback;

use crate::types::call::CallKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    /// Permission refused or no usable device; user-correctable.
    #[error("media acquisition denied: {0}")]
    AcquisitionDenied(String),

    #[error("media session closed")]
    SessionClosed,

    #[error("media session error: {0}")]
    Session(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to one local or remote media track. Cloning shares the
/// underlying enabled/stopped state.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// A bundle of tracks. Cloning shares the track list, mirroring how the
/// manager and the embedding application hold the same stream.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<Mutex<Vec<MediaTrack>>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(Mutex::new(tracks)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().expect("lock should not be poisoned").clone()
    }

    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.tracks()
            .into_iter()
            .filter(|t| t.kind() == kind)
            .collect()
    }

    /// Stop and drop the current video tracks, then carry `track` instead.
    pub fn swap_video_track(&self, track: MediaTrack) {
        let mut tracks = self.tracks.lock().expect("lock should not be poisoned");
        tracks.retain(|t| {
            if t.kind() == TrackKind::Video {
                t.stop();
                false
            } else {
                true
            }
        });
        tracks.push(track);
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Negotiated media/transport parameters, exchanged as offer/answer.
/// The payload is opaque to the signaling core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A connectivity option (address/route) discovered by the engine,
/// relayed to the peer out-of-band. Opaque to the signaling core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Per-session engine configuration. Relay provisioning policy is out of
/// scope; deployments append their own relay entries.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: (0..5)
                    .map(|i| {
                        if i == 0 {
                            "stun:stun.l.google.com:19302".to_string()
                        } else {
                            format!("stun:stun{i}.l.google.com:19302")
                        }
                    })
                    .collect(),
                username: None,
                credential: None,
            }],
        }
    }
}

pub type RemoteTrackCallback = Arc<dyn Fn(MediaStream) + Send + Sync>;
pub type ConnectionStateCallback = Arc<dyn Fn(MediaConnectionState) + Send + Sync>;
pub type LocalCandidateCallback = Arc<dyn Fn(TransportCandidate) + Send + Sync>;

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Acquire local capture for `kind` (audio-only for voice, audio and
    /// video otherwise).
    async fn acquire_local_media(&self, kind: CallKind) -> Result<MediaStream, MediaError>;

    /// Create a fresh per-call session.
    fn create_session(&self, config: &SessionConfig) -> Result<Arc<dyn MediaSession>, MediaError>;
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    fn add_local_track(&self, track: MediaTrack);

    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    /// Feed a peer candidate. Duplicate or out-of-order delivery is the
    /// engine's problem; it rejects what it cannot use.
    async fn add_remote_candidate(&self, candidate: TransportCandidate)
    -> Result<(), MediaError>;

    /// Swap the outgoing video track without renegotiating.
    async fn replace_video_track(&self, track: MediaTrack) -> Result<(), MediaError>;

    fn on_remote_track(&self, cb: RemoteTrackCallback);

    fn on_connection_state_change(&self, cb: ConnectionStateCallback);

    fn on_local_candidate(&self, cb: LocalCandidateCallback);

    /// Tear the session down. Idempotent; no further callbacks fire on
    /// this session afterwards.
    fn close(&self);
}
