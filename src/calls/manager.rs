//! Call session manager.
//!
//! Owns the active session end to end: drives the offer/answer/candidate
//! exchange through the mailbox, holds the media session and its tracks
//! exclusively, and funnels every exit path (explicit end, setup failure,
//! remote hangup, transport drop) through one idempotent teardown
//! routine.
//!
//! All session-state mutation is serialized behind the single `active`
//! owner lock; mailbox and media events arrive as spawned tasks that
//! re-check the session id before touching anything, so events for a
//! torn-down session are no-ops.

use super::error::CallError;
use super::log::CallLogRecorder;
use super::signaling::{self, OfferRecord};
use super::state::{CallSession, CallStatus};
use crate::mailbox::{Mailbox, Subscription};
use crate::media::{
    MediaConnectionState, MediaEngine, MediaSession, MediaStream, MediaTrack, SessionConfig,
    TransportCandidate,
};
use crate::types::call::{CallDirection, CallKind, CallRole, EndReason, SessionId};
use crate::types::events::{
    CallEnded, CallStatusChanged, Event, EventBus, RemoteStreamEvent,
};
use crate::types::user::{PeerId, PeerSnapshot};
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct CallManagerConfig {
    /// Handed to the media engine for every session it creates.
    pub session: SessionConfig,
}

pub struct CallManager {
    mailbox: Arc<dyn Mailbox>,
    media: Arc<dyn MediaEngine>,
    events: EventBus,
    recorder: CallLogRecorder,
    local: PeerSnapshot,
    config: CallManagerConfig,
    /// At most one session per local participant, ever.
    active: Mutex<Option<ActiveSession>>,
}

struct ActiveSession {
    info: CallSession,
    media: Arc<dyn MediaSession>,
    local_stream: MediaStream,
    remote_stream: Option<MediaStream>,
    /// Consumed exactly once at teardown.
    subscriptions: Vec<Subscription>,
    /// Guards against a delayed duplicate answer re-applying the remote
    /// description after it was consumed.
    remote_desc_applied: bool,
}

impl CallManager {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        media: Arc<dyn MediaEngine>,
        events: EventBus,
        local: PeerSnapshot,
        config: CallManagerConfig,
    ) -> Arc<Self> {
        let recorder = CallLogRecorder::new(Arc::clone(&mailbox));
        Arc::new(Self {
            mailbox,
            media,
            events,
            recorder,
            local,
            config,
            active: Mutex::new(None),
        })
    }

    /// Pre-flight the permission prompt: acquire media for `kind` and
    /// release it immediately.
    pub async fn probe_media(&self, kind: CallKind) -> Result<(), CallError> {
        let stream = self.media.acquire_local_media(kind).await?;
        stream.stop_all();
        Ok(())
    }

    /// Place a call to `partner`. On success the session is live in
    /// `connecting` state and negotiation continues in the background; on
    /// any failure everything is unwound and no session exists.
    pub async fn start_outgoing(
        self: &Arc<Self>,
        partner: PeerSnapshot,
        kind: CallKind,
    ) -> Result<SessionId, CallError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(CallError::SessionActive);
        }

        let local_stream = self.media.acquire_local_media(kind).await?;
        // Until the session owns the tracks, stop them on any early exit.
        let stream_guard = scopeguard::guard(local_stream.clone(), |stream| stream.stop_all());

        let session_id: SessionId = self
            .mailbox
            .allocate_child_id(&signaling::inbox_root(&partner.id))
            .await?
            .into();

        // Paired log rows with one shared timestamp; log failures never
        // abort call setup.
        let ts = self.mailbox.now_ms();
        if let Err(e) = self
            .recorder
            .start_log(&self.local.id, partner.clone(), kind, CallDirection::Outgoing, ts)
            .await
        {
            warn!(target: "Calls/Manager", "outgoing log write failed: {e}");
        }
        if let Err(e) = self
            .recorder
            .start_log(&partner.id, self.local.clone(), kind, CallDirection::Incoming, ts)
            .await
        {
            warn!(target: "Calls/Manager", "partner log write failed: {e}");
        }

        let info = CallSession::new_outgoing(session_id.clone(), partner, kind);
        let session = self.establish_outgoing(info, local_stream).await?;
        scopeguard::ScopeGuard::into_inner(stream_guard);
        *active = Some(session);
        Ok(session_id)
    }

    /// Accept a surfaced incoming offer. If media acquisition fails the
    /// offer stays in the inbox for the caller's own cleanup.
    pub async fn accept_incoming(
        self: &Arc<Self>,
        session_id: SessionId,
        offer: OfferRecord,
    ) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(CallError::SessionActive);
        }

        let local_stream = self.media.acquire_local_media(offer.kind).await?;
        let stream_guard = scopeguard::guard(local_stream.clone(), |stream| stream.stop_all());

        let info = CallSession::new_incoming(session_id, offer.caller_snapshot(), offer.kind);
        let session = self.establish_incoming(info, local_stream, &offer).await?;
        scopeguard::ScopeGuard::into_inner(stream_guard);
        *active = Some(session);
        Ok(())
    }

    /// Decline an offer without creating any media or session state.
    pub async fn reject(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.mailbox
            .remove(&signaling::inbox_entry(&self.local.id, session_id))
            .await?;
        Ok(())
    }

    /// Hang up the active session. A positive observed duration is
    /// reconciled into the local call log.
    pub async fn end(&self, observed_duration_secs: u64) -> Result<(), CallError> {
        let session = self
            .active
            .lock()
            .await
            .take()
            .ok_or(CallError::NoActiveSession)?;
        let partner = session.info.partner.id.clone();
        self.teardown(session, EndReason::LocalHangup).await;
        if observed_duration_secs > 0
            && let Err(e) = self
                .recorder
                .finalize_log(&self.local.id, &partner, observed_duration_secs)
                .await
        {
            warn!(target: "Calls/Manager", "duration reconciliation failed: {e}");
        }
        Ok(())
    }

    pub async fn current_session(&self) -> Option<CallSession> {
        self.active.lock().await.as_ref().map(|s| s.info.clone())
    }

    pub async fn has_active_session(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|s| s.local_stream.clone())
    }

    pub async fn remote_stream(&self) -> Option<MediaStream> {
        self.active
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.remote_stream.clone())
    }

    /// Flip the enabled state of the session's local audio tracks.
    pub async fn set_audio_muted(&self, muted: bool) -> Result<(), CallError> {
        let active = self.active.lock().await;
        let session = active.as_ref().ok_or(CallError::NoActiveSession)?;
        for track in session.local_stream.audio_tracks() {
            track.set_enabled(!muted);
        }
        Ok(())
    }

    /// Flip the enabled state of the session's local video tracks.
    pub async fn set_video_off(&self, off: bool) -> Result<(), CallError> {
        let active = self.active.lock().await;
        let session = active.as_ref().ok_or(CallError::NoActiveSession)?;
        for track in session.local_stream.video_tracks() {
            track.set_enabled(!off);
        }
        Ok(())
    }

    /// Swap the outgoing video source (e.g. the other camera) without
    /// renegotiating; the previous track is stopped.
    pub async fn switch_video_source(&self, track: MediaTrack) -> Result<(), CallError> {
        let active = self.active.lock().await;
        let session = active.as_ref().ok_or(CallError::NoActiveSession)?;
        session.media.replace_video_track(track.clone()).await?;
        session.local_stream.swap_video_track(track);
        Ok(())
    }

    async fn establish_outgoing(
        self: &Arc<Self>,
        info: CallSession,
        local_stream: MediaStream,
    ) -> Result<ActiveSession, CallError> {
        let media = self.media.create_session(&self.config.session)?;
        let mut session = ActiveSession {
            info,
            media,
            local_stream,
            remote_stream: None,
            subscriptions: Vec::new(),
            remote_desc_applied: false,
        };
        match self.wire_outgoing(&mut session).await {
            Ok(()) => Ok(session),
            Err(e) => {
                self.teardown(session, EndReason::SetupFailed).await;
                Err(e)
            }
        }
    }

    async fn establish_incoming(
        self: &Arc<Self>,
        info: CallSession,
        local_stream: MediaStream,
        offer: &OfferRecord,
    ) -> Result<ActiveSession, CallError> {
        let media = self.media.create_session(&self.config.session)?;
        let mut session = ActiveSession {
            info,
            media,
            local_stream,
            remote_stream: None,
            subscriptions: Vec::new(),
            remote_desc_applied: false,
        };
        match self.wire_incoming(&mut session, offer).await {
            Ok(()) => Ok(session),
            Err(e) => {
                self.teardown(session, EndReason::SetupFailed).await;
                Err(e)
            }
        }
    }

    async fn wire_outgoing(self: &Arc<Self>, session: &mut ActiveSession) -> Result<(), CallError> {
        self.attach_media_callbacks(session);

        let offer = session.media.create_offer().await?;
        session.media.set_local_description(offer.clone()).await?;
        let record = OfferRecord {
            kind: session.info.kind,
            from: self.local.id.clone(),
            from_display_name: self.local.display_name.clone(),
            from_avatar: self.local.avatar.clone(),
            offer,
            ts: self.mailbox.now_ms(),
            answer: None,
        };
        let entry = signaling::inbox_entry(&session.info.partner.id, &session.info.session_id);
        self.mailbox.publish(&entry, signaling::encode(&record)?).await?;

        self.wire_negotiation(session)
    }

    async fn wire_incoming(
        self: &Arc<Self>,
        session: &mut ActiveSession,
        offer: &OfferRecord,
    ) -> Result<(), CallError> {
        self.attach_media_callbacks(session);

        session.media.set_remote_description(offer.offer.clone()).await?;
        session.remote_desc_applied = true;
        let answer = session.media.create_answer().await?;
        session.media.set_local_description(answer.clone()).await?;
        self.mailbox
            .publish(
                &signaling::answer_path(&self.local.id, &session.info.session_id),
                signaling::encode(&answer)?,
            )
            .await?;

        self.wire_negotiation(session)
    }

    /// Attach local tracks and route every media event to a handler task
    /// keyed by session id.
    fn attach_media_callbacks(self: &Arc<Self>, session: &ActiveSession) {
        for track in session.local_stream.tracks() {
            session.media.add_local_track(track);
        }

        let sid = session.info.session_id.clone();
        let weak = Arc::downgrade(self);

        session.media.on_remote_track(Arc::new({
            let weak = weak.clone();
            let sid = sid.clone();
            move |stream| {
                let Some(manager) = weak.upgrade() else { return };
                let sid = sid.clone();
                tokio::spawn(async move {
                    manager.handle_remote_track(sid, stream).await;
                });
            }
        }));

        session.media.on_connection_state_change(Arc::new({
            let weak = weak.clone();
            let sid = sid.clone();
            move |state| {
                let Some(manager) = weak.upgrade() else { return };
                let sid = sid.clone();
                tokio::spawn(async move {
                    manager.handle_media_state(sid, state).await;
                });
            }
        }));

        let role = session.info.role;
        session.media.on_local_candidate(Arc::new(move |candidate| {
            let Some(manager) = weak.upgrade() else { return };
            let sid = sid.clone();
            tokio::spawn(async move {
                manager.publish_local_candidate(sid, role, candidate).await;
            });
        }));
    }

    /// Shared negotiation wiring for both roles: candidate fan-in, remote
    /// hangup watch, and (for the caller) the answer watch. Every
    /// subscription lands in the session's unsubscribe list.
    fn wire_negotiation(self: &Arc<Self>, session: &mut ActiveSession) -> Result<(), CallError> {
        let sid = session.info.session_id.clone();
        let role = session.info.role;
        let weak = Arc::downgrade(self);

        let subscription = self.mailbox.subscribe_child_added(
            &signaling::candidate_queue(&sid, role.other()),
            Arc::new({
                let weak = weak.clone();
                let sid = sid.clone();
                move |_key, value| {
                    let Some(manager) = weak.upgrade() else { return };
                    let sid = sid.clone();
                    tokio::spawn(async move {
                        manager.handle_remote_candidate(sid, value).await;
                    });
                }
            }),
        )?;
        session.subscriptions.push(subscription);

        // The session entry disappearing while we are live is the remote
        // side hanging up (or rejecting).
        let offer_owner = self.offer_owner(role, &session.info.partner.id);
        let subscription = self.mailbox.subscribe(
            &signaling::inbox_entry(&offer_owner, &sid),
            Arc::new({
                let weak = weak.clone();
                let sid = sid.clone();
                move |value| {
                    if value.is_some() {
                        return;
                    }
                    let Some(manager) = weak.upgrade() else { return };
                    let sid = sid.clone();
                    tokio::spawn(async move {
                        manager.finish_remotely(sid, EndReason::RemoteHangup).await;
                    });
                }
            }),
        )?;
        session.subscriptions.push(subscription);

        if role == CallRole::Caller {
            let subscription = self.mailbox.subscribe(
                &signaling::answer_path(&session.info.partner.id, &sid),
                Arc::new(move |value| {
                    let Some(value) = value else { return };
                    let Some(manager) = weak.upgrade() else { return };
                    let sid = sid.clone();
                    tokio::spawn(async move {
                        manager.handle_answer(sid, value).await;
                    });
                }),
            )?;
            session.subscriptions.push(subscription);
        }

        Ok(())
    }

    /// Caller deletes under the partner's inbox, callee under its own:
    /// both name the same physical entry.
    fn offer_owner(&self, role: CallRole, partner: &PeerId) -> PeerId {
        match role {
            CallRole::Caller => partner.clone(),
            CallRole::Callee => self.local.id.clone(),
        }
    }

    /// Apply the callee's answer, once. Later deliveries of the same
    /// payload are dropped without touching the media session.
    async fn handle_answer(self: &Arc<Self>, session_id: SessionId, value: Value) {
        let mut active = self.active.lock().await;
        let Some(session) = active
            .as_mut()
            .filter(|s| s.info.session_id == session_id)
        else {
            debug!(target: "Calls/Manager", "ignoring event for stale session {session_id}");
            return;
        };
        if session.remote_desc_applied {
            debug!(target: "Calls/Manager", "duplicate answer for {session_id} ignored");
            return;
        }
        let path = signaling::answer_path(&session.info.partner.id, &session_id);
        let answer = match signaling::decode_answer(&path, &value) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(target: "Calls/Manager", "{e}");
                return;
            }
        };
        session.remote_desc_applied = true;
        if let Err(e) = session.media.set_remote_description(answer).await {
            warn!(
                target: "Calls/Manager",
                "{}",
                CallError::NegotiationConflict(e.to_string())
            );
        }
    }

    async fn handle_remote_candidate(self: &Arc<Self>, session_id: SessionId, value: Value) {
        let mut active = self.active.lock().await;
        let Some(session) = active
            .as_mut()
            .filter(|s| s.info.session_id == session_id)
        else {
            debug!(target: "Calls/Manager", "ignoring event for stale session {session_id}");
            return;
        };
        let path = signaling::candidate_queue(&session_id, session.info.role.other());
        let candidate = match signaling::decode_candidate(&path, &value) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(target: "Calls/Manager", "{e}");
                return;
            }
        };
        if let Err(e) = session.media.add_remote_candidate(candidate).await {
            debug!(target: "Calls/Manager", "engine declined candidate: {e}");
        }
    }

    async fn handle_media_state(
        self: &Arc<Self>,
        session_id: SessionId,
        state: MediaConnectionState,
    ) {
        match state {
            MediaConnectionState::Connected => {
                let event = {
                    let mut active = self.active.lock().await;
                    let Some(session) = active
                        .as_mut()
                        .filter(|s| s.info.session_id == session_id)
                    else {
                        debug!(target: "Calls/Manager", "ignoring event for stale session {session_id}");
                        return;
                    };
                    match session.info.advance(CallStatus::Connected) {
                        Ok(()) => Event::CallStatusChanged(CallStatusChanged {
                            session_id: session_id.clone(),
                            status: CallStatus::Connected,
                        }),
                        Err(e) => {
                            debug!(target: "Calls/Manager", "connection report ignored: {e}");
                            return;
                        }
                    }
                };
                self.events.dispatch(&event);
            }
            MediaConnectionState::Disconnected | MediaConnectionState::Failed => {
                self.finish_remotely(session_id, EndReason::TransportLost).await;
            }
            _ => {}
        }
    }

    async fn handle_remote_track(self: &Arc<Self>, session_id: SessionId, stream: MediaStream) {
        let event = {
            let mut active = self.active.lock().await;
            let Some(session) = active
                .as_mut()
                .filter(|s| s.info.session_id == session_id)
            else {
                debug!(target: "Calls/Manager", "ignoring event for stale session {session_id}");
                return;
            };
            session.remote_stream = Some(stream.clone());
            Event::RemoteStream(RemoteStreamEvent { session_id, stream })
        };
        self.events.dispatch(&event);
    }

    /// Publish a locally discovered candidate to this role's queue. Held
    /// under the owner lock so a concurrent teardown cannot leave stray
    /// queue entries behind.
    async fn publish_local_candidate(
        self: &Arc<Self>,
        session_id: SessionId,
        role: CallRole,
        candidate: TransportCandidate,
    ) {
        let active = self.active.lock().await;
        if !active
            .as_ref()
            .is_some_and(|s| s.info.session_id == session_id)
        {
            debug!(target: "Calls/Manager", "ignoring event for stale session {session_id}");
            return;
        }
        let queue = signaling::candidate_queue(&session_id, role);
        let result: Result<(), CallError> = async {
            let key = self.mailbox.allocate_child_id(&queue).await?;
            self.mailbox
                .publish(&queue.child(key), signaling::encode(&candidate)?)
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(target: "Calls/Manager", "candidate publish failed: {e}");
        }
    }

    /// Session ended from the outside: remote hangup or transport drop.
    /// If the call had connected, its duration is reconciled best-effort
    /// from the recorded connection time.
    async fn finish_remotely(self: &Arc<Self>, session_id: SessionId, reason: EndReason) {
        let session = {
            let mut active = self.active.lock().await;
            if active
                .as_ref()
                .is_some_and(|s| s.info.session_id == session_id)
            {
                active.take()
            } else {
                debug!(target: "Calls/Manager", "ignoring event for stale session {session_id}");
                return;
            }
        };
        let Some(session) = session else { return };
        let duration = session.info.connected_duration_secs();
        let partner = session.info.partner.id.clone();
        self.teardown(session, reason).await;
        if let Some(secs) = duration.filter(|s| *s > 0)
            && let Err(e) = self.recorder.finalize_log(&self.local.id, &partner, secs).await
        {
            warn!(target: "Calls/Manager", "duration reconciliation failed: {e}");
        }
    }

    /// The one cleanup routine, used by every exit path. Safe against
    /// concurrent triggers: the session was already taken out of `active`
    /// by the caller, so a second trigger finds nothing to clean.
    async fn teardown(&self, mut session: ActiveSession, reason: EndReason) {
        let sid = session.info.session_id.clone();
        debug!(target: "Calls/Manager", "tearing down session {sid} ({reason:?})");

        session.media.close();
        session.local_stream.stop_all();

        for subscription in session.subscriptions.drain(..) {
            subscription.unsubscribe();
        }

        let offer_owner = self.offer_owner(session.info.role, &session.info.partner.id);
        if let Err(e) = self
            .mailbox
            .remove(&signaling::inbox_entry(&offer_owner, &sid))
            .await
        {
            debug!(target: "Calls/Manager", "signaling entry removal failed: {e}");
        }
        if let Err(e) = self.mailbox.remove(&signaling::candidates_root(&sid)).await {
            debug!(target: "Calls/Manager", "candidate queue removal failed: {e}");
        }

        session.remote_stream = None;
        let _ = session.info.advance(CallStatus::Ended);
        self.events.dispatch(&Event::CallEnded(CallEnded {
            session_id: sid,
            reason,
        }));
    }
}
