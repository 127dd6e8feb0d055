//! In-process media engine.
//!
//! Stands in for a real capture/transport stack in tests and demos: the
//! offer/answer payloads carry a session token, two sessions link up when
//! each has applied the other's description, and a session reports
//! `Connected` once it additionally holds at least one remote candidate.
//! The peer's local tracks are then delivered as the remote stream.

use super::{
    ConnectionStateCallback, LocalCandidateCallback, MediaConnectionState, MediaEngine,
    MediaError, MediaSession, MediaStream, MediaTrack, RemoteTrackCallback, SessionConfig,
    SessionDescription, SdpType, TrackKind, TransportCandidate,
};
use crate::types::call::CallKind;
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const SDP_TOKEN_PREFIX: &str = "loopback:";

pub struct LoopbackMediaEngine {
    registry: Arc<Registry>,
    deny_media: AtomicBool,
    next_id: AtomicU64,
}

struct Registry {
    sessions: DashMap<String, Arc<LoopbackSession>>,
}

impl Default for LoopbackMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMediaEngine {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                sessions: DashMap::new(),
            }),
            deny_media: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make subsequent `acquire_local_media` calls fail as if the user
    /// refused the permission prompt.
    pub fn deny_media(&self, deny: bool) {
        self.deny_media.store(deny, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaEngine for LoopbackMediaEngine {
    async fn acquire_local_media(&self, kind: CallKind) -> Result<MediaStream, MediaError> {
        if self.deny_media.load(Ordering::SeqCst) {
            return Err(MediaError::AcquisitionDenied(
                "permission prompt refused".into(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut tracks = vec![MediaTrack::new(format!("local-{id}-audio"), TrackKind::Audio)];
        if kind.has_video() {
            tracks.push(MediaTrack::new(
                format!("local-{id}-video"),
                TrackKind::Video,
            ));
        }
        Ok(MediaStream::new(format!("local-{id}"), tracks))
    }

    fn create_session(
        &self,
        _config: &SessionConfig,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let salt: u32 = rand::rng().random();
        let token = format!(
            "lb-{}-{salt:08x}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let session = Arc::new(LoopbackSession {
            token: token.clone(),
            registry: Arc::clone(&self.registry),
            state: Mutex::new(Inner::default()),
        });
        self.registry.sessions.insert(token, Arc::clone(&session));
        Ok(session)
    }
}

pub struct LoopbackSession {
    token: String,
    registry: Arc<Registry>,
    state: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    local_tracks: Vec<MediaTrack>,
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    peer_token: Option<String>,
    remote_candidate_count: usize,
    candidates_emitted: bool,
    connected: bool,
    closed: bool,
    on_remote_track: Option<RemoteTrackCallback>,
    on_state: Option<ConnectionStateCallback>,
    on_candidate: Option<LocalCandidateCallback>,
}

impl LoopbackSession {
    fn description(&self, sdp_type: SdpType) -> SessionDescription {
        SessionDescription {
            sdp_type,
            sdp: format!("v=0 {SDP_TOKEN_PREFIX}{}", self.token),
        }
    }

    fn local_stream(&self) -> MediaStream {
        let inner = self.state.lock().expect("lock should not be poisoned");
        MediaStream::new(format!("remote-{}", self.token), inner.local_tracks.clone())
    }

    /// Flip to connected once descriptions are exchanged and at least one
    /// peer candidate arrived; then deliver the peer's stream.
    fn try_establish(&self) {
        let (state_cb, track_cb, peer_token) = {
            let mut inner = self.state.lock().expect("lock should not be poisoned");
            if inner.closed
                || inner.connected
                || inner.local_desc.is_none()
                || inner.remote_desc.is_none()
                || inner.remote_candidate_count == 0
            {
                return;
            }
            inner.connected = true;
            (
                inner.on_state.clone(),
                inner.on_remote_track.clone(),
                inner.peer_token.clone(),
            )
        };
        debug!(target: "Media/Loopback", "session {} established", self.token);
        if let Some(cb) = state_cb {
            cb(MediaConnectionState::Connected);
        }
        let peer_stream = peer_token
            .and_then(|t| self.registry.sessions.get(&t).map(|p| p.value().clone()))
            .map(|peer| peer.local_stream());
        if let (Some(cb), Some(stream)) = (track_cb, peer_stream) {
            cb(stream);
        }
    }

    fn notify_disconnected(&self) {
        let cb = {
            let mut inner = self.state.lock().expect("lock should not be poisoned");
            if inner.closed {
                None
            } else {
                inner.connected = false;
                inner.on_state.clone()
            }
        };
        if let Some(cb) = cb {
            cb(MediaConnectionState::Disconnected);
        }
    }

    fn ensure_open(inner: &Inner) -> Result<(), MediaError> {
        if inner.closed {
            Err(MediaError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaSession for LoopbackSession {
    fn add_local_track(&self, track: MediaTrack) {
        self.state
            .lock()
            .expect("lock should not be poisoned")
            .local_tracks
            .push(track);
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let inner = self.state.lock().expect("lock should not be poisoned");
        Self::ensure_open(&inner)?;
        Ok(self.description(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let inner = self.state.lock().expect("lock should not be poisoned");
        Self::ensure_open(&inner)?;
        if inner.remote_desc.is_none() {
            return Err(MediaError::Session(
                "cannot answer without a remote description".into(),
            ));
        }
        Ok(self.description(SdpType::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let (emit, cb) = {
            let mut inner = self.state.lock().expect("lock should not be poisoned");
            Self::ensure_open(&inner)?;
            inner.local_desc = Some(desc);
            let emit = !inner.candidates_emitted;
            inner.candidates_emitted = true;
            (emit, inner.on_candidate.clone())
        };
        if emit && let Some(cb) = cb {
            for (index, port) in [(0u16, 50100u16), (1, 50101)] {
                cb(TransportCandidate {
                    candidate: format!(
                        "candidate:{index} 1 udp 2122260223 127.0.0.1 {port} typ host"
                    ),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                });
            }
        }
        self.try_establish();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        {
            let mut inner = self.state.lock().expect("lock should not be poisoned");
            Self::ensure_open(&inner)?;
            let token = desc
                .sdp
                .split_once(SDP_TOKEN_PREFIX)
                .map(|(_, token)| token.trim().to_string())
                .ok_or_else(|| MediaError::Session("unrecognized description payload".into()))?;
            inner.peer_token = Some(token);
            inner.remote_desc = Some(desc);
        }
        self.try_establish();
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: TransportCandidate,
    ) -> Result<(), MediaError> {
        {
            let mut inner = self.state.lock().expect("lock should not be poisoned");
            Self::ensure_open(&inner)?;
            debug!(
                target: "Media/Loopback",
                "session {} got candidate {}", self.token, candidate.candidate
            );
            inner.remote_candidate_count += 1;
        }
        self.try_establish();
        Ok(())
    }

    async fn replace_video_track(&self, track: MediaTrack) -> Result<(), MediaError> {
        let mut inner = self.state.lock().expect("lock should not be poisoned");
        Self::ensure_open(&inner)?;
        inner.local_tracks.retain(|t| t.kind() != TrackKind::Video);
        inner.local_tracks.push(track);
        Ok(())
    }

    fn on_remote_track(&self, cb: RemoteTrackCallback) {
        self.state
            .lock()
            .expect("lock should not be poisoned")
            .on_remote_track = Some(cb);
    }

    fn on_connection_state_change(&self, cb: ConnectionStateCallback) {
        self.state
            .lock()
            .expect("lock should not be poisoned")
            .on_state = Some(cb);
    }

    fn on_local_candidate(&self, cb: LocalCandidateCallback) {
        self.state
            .lock()
            .expect("lock should not be poisoned")
            .on_candidate = Some(cb);
    }

    fn close(&self) {
        let peer_token = {
            let mut inner = self.state.lock().expect("lock should not be poisoned");
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.connected = false;
            inner.peer_token.clone()
        };
        self.registry.sessions.remove(&self.token);
        if let Some(peer) =
            peer_token.and_then(|t| self.registry.sessions.get(&t).map(|p| p.value().clone()))
        {
            peer.notify_disconnected();
        }
    }
}
