//! Call session management
//!
//! [`CallSessionManager`] drives a single call with one remote user at a time:
//! ringing, accept/reject, SDP offer/answer, ICE relay, mute toggles and
//! teardown. All mutable state lives in one [`Session`] behind an async mutex,
//! so user operations, signaling events and peer link callbacks never
//! interleave mid-transition.
//!
//! # Negotiation
//!
//! ```text
//!   caller                      server                      callee
//!     │ call-user ─────────────────►│── incoming-call ─────────►│
//!     │◄──────── call-answered ─────│◄──────────── answer-call ─│
//!     │ webrtc-offer ──────────────►│── webrtc-offer ──────────►│
//!     │◄──────── webrtc-answer ─────│◄────────── webrtc-answer ─│
//!     │◄═══════════ webrtc-ice (both directions) ══════════════►│
//! ```

use crate::identity::UserId;
use crate::media::{MediaCapture, MediaCaptureProvider, MediaError, TrackKind};
use crate::peer::{PeerLink, PeerLinkError, PeerLinkEvent, PeerLinkFactory, PeerLinkObserver};
use crate::signaling::{
    AnswerCallPayload, AnswerPayload, CallUserPayload, EndCallPayload, IcePayload, OfferPayload,
    SignalingHandler, SignalingMessage, SignalingTransport,
};
use crate::types::{
    CallEvent, CallState, EndReason, FailureKind, IceCandidate, IceServer, MediaPreferences,
    SdpType, SessionDescription, ToggleState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// Call-related errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Local media could not be captured
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    /// SDP negotiation failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The callee declined
    #[error("Call rejected by remote user")]
    RemoteRejected,

    /// The remote side never answered or the connection dropped
    #[error("Remote user unreachable")]
    PeerUnreachable,

    /// A call is already in progress
    #[error("Another call is in progress")]
    Busy,

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Signaling channel error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Peer link error
    #[error("Peer link error: {0}")]
    PeerLink(#[from] PeerLinkError),
}

impl CallError {
    /// Error describing a call that ended for `reason`, `None` for a normal end
    #[must_use]
    pub fn from_end_reason(reason: EndReason) -> Option<Self> {
        match reason {
            EndReason::LocalHangup
            | EndReason::RemoteHangup
            | EndReason::Declined
            | EndReason::Missed => None,
            // Already returned to the caller of accept_call
            EndReason::Failed(FailureKind::MediaAcquisition) => None,
            EndReason::Rejected => Some(Self::RemoteRejected),
            EndReason::Failed(FailureKind::PeerUnreachable) => Some(Self::PeerUnreachable),
            EndReason::Failed(FailureKind::Negotiation) => {
                Some(Self::Negotiation("call setup did not complete".to_string()))
            }
            EndReason::Failed(FailureKind::Signaling) => {
                Some(Self::Signaling("signaling channel lost".to_string()))
            }
        }
    }
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// STUN/TURN servers for every new peer link
    pub ice_servers: Vec<IceServer>,
    /// How long a call may ring before it is given up
    pub ring_timeout_ms: u64,
    /// How long offer/answer may take once the call was accepted
    pub negotiation_timeout_ms: u64,
    /// Remote candidates buffered before the remote description is set
    pub max_pending_candidates: usize,
    /// Answer `accept:false` to incoming calls while busy instead of ignoring them
    pub auto_reject_when_busy: bool,
}

impl CallManagerConfig {
    /// Ring timeout as a duration
    #[must_use]
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    /// Negotiation timeout as a duration
    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            ring_timeout_ms: 30_000,
            negotiation_timeout_ms: 15_000,
            max_pending_candidates: 64,
            auto_reject_when_busy: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Ring,
    Negotiation,
}

struct ActiveLink {
    id: u64,
    peer: UserId,
    link: Arc<dyn PeerLink>,
    remote_rebuilt: bool,
    remote_description_set: bool,
    offer_sent: bool,
    pending_candidates: Vec<IceCandidate>,
}

/// Mutable state of the manager
struct Session {
    state: CallState,
    // Bumped on every transition and timer arm; stale timers compare unequal
    generation: u64,
    next_link_id: u64,
    link: Option<ActiveLink>,
    local: MediaCapture,
    remote: MediaCapture,
    toggles: ToggleState,
    connected_at: Option<DateTime<Utc>>,
}

/// Single-peer call session manager
pub struct CallSessionManager<T: SignalingTransport> {
    local_user: UserId,
    signaling: Arc<SignalingHandler<T>>,
    media: Arc<dyn MediaCaptureProvider>,
    links: Arc<dyn PeerLinkFactory>,
    config: CallManagerConfig,
    session: Mutex<Session>,
    event_sender: broadcast::Sender<CallEvent>,
    link_tx: mpsc::UnboundedSender<(u64, PeerLinkEvent)>,
    // Held by the running pump; survives it so the pump can be restarted
    link_rx: Arc<Mutex<mpsc::UnboundedReceiver<(u64, PeerLinkEvent)>>>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl<T: SignalingTransport> CallSessionManager<T> {
    /// Create a manager for `local_user`
    ///
    /// The manager does nothing until [`start`](Self::start) spawns its event
    /// pump; inbound events may also be fed by hand through
    /// [`handle_signal`](Self::handle_signal).
    pub fn new(
        local_user: UserId,
        signaling: Arc<SignalingHandler<T>>,
        media: Arc<dyn MediaCaptureProvider>,
        links: Arc<dyn PeerLinkFactory>,
        config: CallManagerConfig,
    ) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(100);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|self_ref| Self {
            local_user,
            signaling,
            media,
            links,
            config,
            session: Mutex::new(Session {
                state: CallState::Idle,
                generation: 0,
                next_link_id: 0,
                link: None,
                local: MediaCapture::new(),
                remote: MediaCapture::new(),
                toggles: ToggleState::default(),
                connected_at: None,
            }),
            event_sender,
            link_tx,
            link_rx: Arc::new(Mutex::new(link_rx)),
            pump: parking_lot::Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Local user id
    #[must_use]
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Manager configuration
    #[must_use]
    pub fn config(&self) -> &CallManagerConfig {
        &self.config
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Start the event pump reading signaling messages and peer link events
    ///
    /// The pump stops when the signaling channel closes; reconnect the
    /// transport and call `start` again to resume.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the pump is already running
    pub fn start(&self) -> Result<(), CallError> {
        let mut pump = self.pump.lock();
        if pump.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(CallError::InvalidState(
                "call manager already started".to_string(),
            ));
        }
        let signaling = self.signaling.clone();
        let link_rx = self.link_rx.clone();
        let weak = self.self_ref.clone();

        let handle = tokio::spawn(async move {
            let mut link_rx = link_rx.lock().await;
            loop {
                tokio::select! {
                    received = signaling.receive_message() => match received {
                        Ok(Some(message)) => {
                            let Some(manager) = weak.upgrade() else { break };
                            manager.handle_signal(message).await;
                        }
                        Ok(None) => {
                            tracing::info!("Signaling channel closed");
                            if let Some(manager) = weak.upgrade() {
                                manager.handle_channel_closed().await;
                            }
                            break;
                        }
                        // Handler already backed off
                        Err(_) => continue,
                    },
                    Some((link_id, event)) = link_rx.recv() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.handle_link_event(link_id, event).await;
                    }
                }
            }
            tracing::debug!("Call event pump stopped");
        });

        *pump = Some(handle);
        tracing::debug!(user = %self.local_user, "Call manager started");
        Ok(())
    }

    /// End any call and stop the event pump
    pub async fn dispose(&self) {
        if let Err(e) = self.end_call().await {
            tracing::warn!(error = %e, "Failed to end call during dispose");
        }
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        tracing::debug!(user = %self.local_user, "Call manager disposed");
    }

    /// Current call state
    pub async fn state(&self) -> CallState {
        self.session.lock().await.state.clone()
    }

    /// Current mic/cam switches
    pub async fn toggles(&self) -> ToggleState {
        self.session.lock().await.toggles
    }

    /// Local tracks (shares flags with the manager's copy)
    pub async fn local_capture(&self) -> MediaCapture {
        self.session.lock().await.local.clone()
    }

    /// Remote tracks received so far
    pub async fn remote_capture(&self) -> MediaCapture {
        self.session.lock().await.remote.clone()
    }

    /// When the current call became active
    pub async fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.session.lock().await.connected_at
    }

    /// Call a remote user
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a call is in progress, `MediaAcquisition` if local
    /// media cannot be captured, or a link/signaling error. On error the
    /// manager stays `Idle`.
    #[tracing::instrument(skip(self), fields(peer = %to_user_id))]
    pub async fn place_call(
        &self,
        to_user_id: UserId,
        media: MediaPreferences,
    ) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        if !session.state.is_idle() {
            tracing::warn!(state = session.state.name(), "Refusing to place call while busy");
            return Err(CallError::Busy);
        }

        self.prepare_link(&mut session, &to_user_id, media).await?;

        let message = SignalingMessage::CallUser(CallUserPayload {
            from_user_id: self.local_user.clone(),
            to_user_id: to_user_id.clone(),
            media,
        });
        if let Err(e) = self.send(message).await {
            self.abandon_link(&mut session).await;
            return Err(e);
        }

        self.set_state(
            &mut session,
            CallState::Outgoing {
                to_user_id,
                media,
            },
        );
        self.arm_timer(&mut session, TimerKind::Ring);
        tracing::info!("Calling");
        Ok(())
    }

    /// Accept the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without side effects when nothing is ringing.
    /// Media or link failures decline the call towards the caller and return
    /// the error.
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        let (from_user_id, media) = match &session.state {
            CallState::IncomingOffered {
                from_user_id,
                media,
            } => (from_user_id.clone(), *media),
            other => {
                return Err(CallError::InvalidState(format!(
                    "cannot accept while {}",
                    other.name()
                )))
            }
        };

        if let Err(e) = self.prepare_link(&mut session, &from_user_id, media).await {
            tracing::error!(peer = %from_user_id, error = %e, "Failed to prepare accepted call");
            self.send_answer(&from_user_id, false).await;
            self.set_state(&mut session, CallState::Idle);
            let kind = match e {
                CallError::MediaAcquisition(_) => FailureKind::MediaAcquisition,
                _ => FailureKind::Negotiation,
            };
            self.emit(CallEvent::CallEnded {
                peer_user_id: Some(from_user_id),
                reason: EndReason::Failed(kind),
            });
            return Err(e);
        }

        let message = SignalingMessage::AnswerCall(AnswerCallPayload {
            from_user_id: self.local_user.clone(),
            to_user_id: from_user_id.clone(),
            accept: true,
        });
        if let Err(e) = self.send(message).await {
            self.teardown(&mut session, EndReason::Failed(FailureKind::Signaling), false)
                .await;
            return Err(e);
        }

        self.set_state(
            &mut session,
            CallState::Answering {
                from_user_id: from_user_id.clone(),
                media,
            },
        );
        self.arm_timer(&mut session, TimerKind::Negotiation);
        tracing::info!(peer = %from_user_id, "Call accepted, waiting for offer");
        Ok(())
    }

    /// Decline the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when nothing is ringing
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        match &session.state {
            CallState::IncomingOffered { from_user_id, .. } => {
                let from_user_id = from_user_id.clone();
                self.decline(&mut session, from_user_id, EndReason::Declined)
                    .await;
                Ok(())
            }
            other => Err(CallError::InvalidState(format!(
                "cannot reject while {}",
                other.name()
            ))),
        }
    }

    /// Hang up; no-op when idle
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for transports that report send errors
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        match &session.state {
            CallState::Idle => Ok(()),
            CallState::IncomingOffered { from_user_id, .. } => {
                let from_user_id = from_user_id.clone();
                self.decline(&mut session, from_user_id, EndReason::Declined)
                    .await;
                Ok(())
            }
            _ => {
                self.teardown(&mut session, EndReason::LocalHangup, true)
                    .await;
                Ok(())
            }
        }
    }

    /// Flip the microphone switch, returning the new value
    pub async fn toggle_mic(&self) -> bool {
        let mut session = self.session.lock().await;
        session.toggles.mic_on = !session.toggles.mic_on;
        let mic_on = session.toggles.mic_on;
        let changed = session.local.set_enabled(TrackKind::Audio, mic_on);
        tracing::debug!(mic_on, tracks = changed, "Microphone toggled");
        mic_on
    }

    /// Flip the camera switch, returning the new value
    pub async fn toggle_cam(&self) -> bool {
        let mut session = self.session.lock().await;
        session.toggles.cam_on = !session.toggles.cam_on;
        let cam_on = session.toggles.cam_on;
        let changed = session.local.set_enabled(TrackKind::Video, cam_on);
        tracing::debug!(cam_on, tracks = changed, "Camera toggled");
        cam_on
    }

    /// Process one inbound signaling message
    pub async fn handle_signal(&self, message: SignalingMessage) {
        let mut session = self.session.lock().await;
        match message {
            SignalingMessage::IncomingCall(payload) => {
                self.on_incoming_call(&mut session, payload.from_user_id, payload.media)
                    .await;
            }
            SignalingMessage::CallAnswered(payload) => {
                self.on_call_answered(&mut session, payload.accept).await;
            }
            SignalingMessage::WebrtcOffer(payload) => {
                self.on_offer(&mut session, payload.offer).await;
            }
            SignalingMessage::WebrtcAnswer(payload) => {
                self.on_answer(&mut session, payload.answer).await;
            }
            SignalingMessage::WebrtcIce(payload) => {
                self.on_remote_candidate(&mut session, payload.candidate)
                    .await;
            }
            SignalingMessage::CallEnded(_) | SignalingMessage::EndCall(_) => {
                self.on_remote_hangup(&mut session).await;
            }
            other => {
                tracing::debug!(event = other.event_name(), "Ignoring outbound-only event");
            }
        }
    }

    /// Process one peer link callback
    pub async fn handle_link_event(&self, link_id: u64, event: PeerLinkEvent) {
        let mut session = self.session.lock().await;
        let Some(active) = session.link.as_ref() else {
            tracing::debug!(link_id, "Dropping event for closed link");
            return;
        };
        if active.id != link_id {
            tracing::debug!(link_id, current = active.id, "Dropping event for stale link");
            return;
        }
        let peer = active.peer.clone();

        match event {
            PeerLinkEvent::LocalCandidate(Some(candidate))
                if !candidate.is_end_of_candidates() =>
            {
                let message = SignalingMessage::WebrtcIce(IcePayload {
                    to_user_id: Some(peer),
                    candidate: Some(candidate),
                });
                if let Err(e) = self.send(message).await {
                    tracing::warn!(error = %e, "Failed to relay local candidate");
                }
            }
            PeerLinkEvent::LocalCandidate(_) => {
                tracing::trace!(link_id, "Local candidate gathering complete");
            }
            PeerLinkEvent::RemoteTrack(track) => {
                let rebuild = session
                    .link
                    .as_mut()
                    .map(|active| !std::mem::replace(&mut active.remote_rebuilt, true))
                    .unwrap_or(false);
                if rebuild {
                    session.remote.stop_all();
                    session.remote = MediaCapture::new();
                }
                let (track_id, kind) = (track.id().to_string(), track.kind());
                session.remote.add_track(track);
                tracing::info!(track_id = %track_id, kind = %kind, "Remote track added");
                self.emit(CallEvent::RemoteTrackAdded { track_id, kind });
            }
            PeerLinkEvent::Connected => {
                tracing::info!(link_id, peer = %peer, "Peer connection established");
            }
            PeerLinkEvent::ConnectionFailed => {
                tracing::error!(link_id, peer = %peer, "Peer connection failed");
                self.teardown(
                    &mut session,
                    EndReason::Failed(FailureKind::PeerUnreachable),
                    true,
                )
                .await;
            }
        }
    }

    async fn handle_channel_closed(&self) {
        let mut session = self.session.lock().await;
        if !session.state.is_idle() {
            self.teardown(&mut session, EndReason::Failed(FailureKind::Signaling), false)
                .await;
        }
    }

    async fn on_incoming_call(
        &self,
        session: &mut Session,
        from_user_id: UserId,
        media: MediaPreferences,
    ) {
        if !session.state.is_idle() {
            tracing::warn!(
                peer = %from_user_id,
                state = session.state.name(),
                auto_reject = self.config.auto_reject_when_busy,
                "Incoming call while busy"
            );
            if self.config.auto_reject_when_busy {
                self.send_answer(&from_user_id, false).await;
            }
            return;
        }

        tracing::info!(peer = %from_user_id, audio = media.audio, video = media.video, "Incoming call");
        self.set_state(
            session,
            CallState::IncomingOffered {
                from_user_id: from_user_id.clone(),
                media,
            },
        );
        self.emit(CallEvent::IncomingCall {
            from_user_id,
            media,
        });
        self.arm_timer(session, TimerKind::Ring);
    }

    async fn on_call_answered(&self, session: &mut Session, accept: bool) {
        let awaiting = matches!(session.state, CallState::Outgoing { .. })
            && session.link.as_ref().is_some_and(|l| !l.offer_sent);
        if !awaiting {
            tracing::warn!(state = session.state.name(), accept, "Ignoring unexpected call-answered");
            return;
        }

        if !accept {
            tracing::info!("Call rejected by remote user");
            self.teardown(session, EndReason::Rejected, false).await;
            return;
        }

        let Some((link, peer)) = session.link.as_ref().map(|l| (l.link.clone(), l.peer.clone()))
        else {
            return;
        };

        let offer = match Self::make_offer(link.as_ref()).await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail_negotiation(session, &e.to_string()).await;
                return;
            }
        };

        let message = SignalingMessage::WebrtcOffer(OfferPayload {
            to_user_id: Some(peer),
            offer,
        });
        if let Err(e) = self.send(message).await {
            tracing::error!(error = %e, "Failed to send offer");
            self.teardown(session, EndReason::Failed(FailureKind::Signaling), false)
                .await;
            return;
        }

        if let Some(active) = session.link.as_mut() {
            active.offer_sent = true;
        }
        self.arm_timer(session, TimerKind::Negotiation);
        tracing::debug!("Offer sent");
    }

    async fn on_offer(&self, session: &mut Session, offer: SessionDescription) {
        let from_user_id = match &session.state {
            CallState::Answering { from_user_id, .. } => from_user_id.clone(),
            other => {
                tracing::warn!(state = other.name(), "Ignoring offer outside of answering");
                return;
            }
        };
        if offer.sdp_type != SdpType::Offer {
            self.fail_negotiation(session, "webrtc-offer did not carry an offer")
                .await;
            return;
        }
        let Some(link) = session.link.as_ref().map(|l| l.link.clone()) else {
            return;
        };

        if let Err(e) = link.set_remote_description(&offer).await {
            self.fail_negotiation(session, &e.to_string()).await;
            return;
        }
        Self::flush_candidates(session).await;

        let answer = match Self::make_answer(link.as_ref()).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_negotiation(session, &e.to_string()).await;
                return;
            }
        };

        let message = SignalingMessage::WebrtcAnswer(AnswerPayload {
            to_user_id: Some(from_user_id.clone()),
            answer,
        });
        if let Err(e) = self.send(message).await {
            tracing::error!(error = %e, "Failed to send answer");
            self.teardown(session, EndReason::Failed(FailureKind::Signaling), false)
                .await;
            return;
        }

        session.connected_at = Some(Utc::now());
        self.set_state(
            session,
            CallState::Active {
                peer_user_id: from_user_id,
            },
        );
        tracing::info!("Call active");
    }

    async fn on_answer(&self, session: &mut Session, answer: SessionDescription) {
        let to_user_id = match &session.state {
            CallState::Outgoing { to_user_id, .. } => to_user_id.clone(),
            other => {
                tracing::warn!(state = other.name(), "Ignoring answer outside of outgoing call");
                return;
            }
        };
        let Some(link) = session
            .link
            .as_ref()
            .filter(|l| l.offer_sent && !l.remote_description_set)
            .map(|l| l.link.clone())
        else {
            tracing::warn!("Ignoring answer without an outstanding offer");
            return;
        };
        if answer.sdp_type != SdpType::Answer {
            self.fail_negotiation(session, "webrtc-answer did not carry an answer")
                .await;
            return;
        }

        if let Err(e) = link.set_remote_description(&answer).await {
            self.fail_negotiation(session, &e.to_string()).await;
            return;
        }
        Self::flush_candidates(session).await;

        session.connected_at = Some(Utc::now());
        self.set_state(
            session,
            CallState::Active {
                peer_user_id: to_user_id,
            },
        );
        tracing::info!("Call active");
    }

    async fn on_remote_candidate(&self, session: &mut Session, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate.filter(|c| !c.is_end_of_candidates()) else {
            tracing::trace!("Ignoring end-of-candidates marker");
            return;
        };
        let max_pending = self.config.max_pending_candidates;
        let Some(active) = session.link.as_mut() else {
            tracing::warn!(state = session.state.name(), "Ignoring candidate without a peer link");
            return;
        };

        if !active.remote_description_set {
            if active.pending_candidates.len() < max_pending {
                active.pending_candidates.push(candidate);
                tracing::trace!(pending = active.pending_candidates.len(), "Buffered remote candidate");
            } else {
                tracing::warn!(max_pending, "Candidate buffer full, dropping candidate");
            }
            return;
        }

        if let Err(e) = active.link.add_ice_candidate(&candidate).await {
            tracing::warn!(error = %e, "Failed to add remote candidate");
        }
    }

    async fn on_remote_hangup(&self, session: &mut Session) {
        match &session.state {
            CallState::Idle => {
                tracing::debug!("Ignoring hangup while idle");
            }
            CallState::IncomingOffered { from_user_id, .. } => {
                let from_user_id = from_user_id.clone();
                tracing::info!(peer = %from_user_id, "Caller hung up while ringing");
                self.set_state(session, CallState::Idle);
                self.emit(CallEvent::CallEnded {
                    peer_user_id: Some(from_user_id),
                    reason: EndReason::RemoteHangup,
                });
            }
            _ => {
                self.teardown(session, EndReason::RemoteHangup, false).await;
            }
        }
    }

    async fn on_timer(&self, generation: u64, kind: TimerKind) {
        let mut session = self.session.lock().await;
        if session.generation != generation {
            return;
        }

        match (kind, &session.state) {
            (TimerKind::Ring, CallState::Outgoing { .. }) => {
                tracing::warn!("No answer before ring timeout");
                self.teardown(
                    &mut session,
                    EndReason::Failed(FailureKind::PeerUnreachable),
                    true,
                )
                .await;
            }
            (TimerKind::Ring, CallState::IncomingOffered { from_user_id, .. }) => {
                let from_user_id = from_user_id.clone();
                tracing::info!(peer = %from_user_id, "Incoming call missed");
                self.decline(&mut session, from_user_id, EndReason::Missed)
                    .await;
            }
            (TimerKind::Negotiation, CallState::Outgoing { .. } | CallState::Answering { .. }) => {
                tracing::error!("Negotiation timed out");
                self.teardown(
                    &mut session,
                    EndReason::Failed(FailureKind::Negotiation),
                    true,
                )
                .await;
            }
            _ => {}
        }
    }

    async fn make_offer(link: &dyn PeerLink) -> Result<SessionDescription, PeerLinkError> {
        let offer = link.create_offer().await?;
        link.set_local_description(&offer).await?;
        Ok(offer)
    }

    async fn make_answer(link: &dyn PeerLink) -> Result<SessionDescription, PeerLinkError> {
        let answer = link.create_answer().await?;
        link.set_local_description(&answer).await?;
        Ok(answer)
    }

    async fn flush_candidates(session: &mut Session) {
        let Some(active) = session.link.as_mut() else {
            return;
        };
        active.remote_description_set = true;
        let pending = std::mem::take(&mut active.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Flushing buffered candidates");
        }
        for candidate in pending {
            if let Err(e) = active.link.add_ice_candidate(&candidate).await {
                tracing::warn!(error = %e, "Failed to add buffered candidate");
            }
        }
    }

    /// Create the link, acquire media and attach it; rolls back on error
    async fn prepare_link(
        &self,
        session: &mut Session,
        peer: &UserId,
        media: MediaPreferences,
    ) -> Result<(), CallError> {
        session.next_link_id += 1;
        let link_id = session.next_link_id;
        let observer = PeerLinkObserver::new(link_id, self.link_tx.clone());
        let link = self.links.create(&self.config.ice_servers, observer).await?;
        session.link = Some(ActiveLink {
            id: link_id,
            peer: peer.clone(),
            link: link.clone(),
            remote_rebuilt: false,
            remote_description_set: false,
            offer_sent: false,
            pending_candidates: Vec::new(),
        });
        tracing::debug!(link_id, peer = %peer, "Peer link created");

        let capture = match self.media.acquire(media).await {
            Ok(capture) => capture,
            Err(e) => {
                tracing::error!(error = %e, "Failed to acquire local media");
                self.abandon_link(session).await;
                return Err(CallError::MediaAcquisition(e));
            }
        };

        capture.set_enabled(TrackKind::Audio, session.toggles.mic_on);
        capture.set_enabled(TrackKind::Video, session.toggles.cam_on);
        for track in capture.tracks() {
            if let Err(e) = link.add_track(track).await {
                capture.stop_all();
                self.abandon_link(session).await;
                return Err(CallError::PeerLink(e));
            }
        }

        session.local.stop_all();
        session.local = capture;
        Ok(())
    }

    async fn abandon_link(&self, session: &mut Session) {
        if let Some(active) = session.link.take() {
            if let Err(e) = active.link.close().await {
                tracing::warn!(link_id = active.id, error = %e, "Failed to close peer link");
            }
        }
        session.local.stop_all();
    }

    async fn fail_negotiation(&self, session: &mut Session, reason: &str) {
        tracing::error!(reason, state = session.state.name(), "Negotiation failed");
        self.teardown(session, EndReason::Failed(FailureKind::Negotiation), true)
            .await;
    }

    async fn decline(&self, session: &mut Session, from_user_id: UserId, reason: EndReason) {
        self.send_answer(&from_user_id, false).await;
        self.set_state(session, CallState::Idle);
        self.emit(CallEvent::CallEnded {
            peer_user_id: Some(from_user_id),
            reason,
        });
    }

    /// Release the link and all tracks, then return to idle
    async fn teardown(&self, session: &mut Session, reason: EndReason, notify_remote: bool) {
        let peer = session.state.peer().cloned();

        if let Some(active) = session.link.take() {
            if notify_remote {
                let message = SignalingMessage::EndCall(EndCallPayload {
                    to_user_id: Some(active.peer.clone()),
                });
                if let Err(e) = self.send(message).await {
                    tracing::warn!(error = %e, "Failed to notify remote user of hangup");
                }
            }
            if let Err(e) = active.link.close().await {
                tracing::warn!(link_id = active.id, error = %e, "Failed to close peer link");
            }
        }

        session.local.stop_all();
        session.remote.stop_all();
        let duration = session
            .connected_at
            .take()
            .map(|at| (Utc::now() - at).num_seconds());

        if !session.state.is_idle() {
            self.set_state(session, CallState::Idle);
        }
        tracing::info!(peer = ?peer, reason = ?reason, duration_secs = ?duration, "Call ended");
        self.emit(CallEvent::CallEnded {
            peer_user_id: peer,
            reason,
        });
    }

    async fn send_answer(&self, to_user_id: &UserId, accept: bool) {
        let message = SignalingMessage::AnswerCall(AnswerCallPayload {
            from_user_id: self.local_user.clone(),
            to_user_id: to_user_id.clone(),
            accept,
        });
        if let Err(e) = self.send(message).await {
            tracing::warn!(peer = %to_user_id, accept, error = %e, "Failed to send answer-call");
        }
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), CallError> {
        self.signaling
            .send_message(message)
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))
    }

    fn set_state(&self, session: &mut Session, state: CallState) {
        tracing::debug!(from = session.state.name(), to = state.name(), "Call state transition");
        session.state = state.clone();
        session.generation += 1;
        self.emit(CallEvent::StateChanged { state });
    }

    fn arm_timer(&self, session: &mut Session, kind: TimerKind) {
        session.generation += 1;
        let generation = session.generation;
        let timeout = match kind {
            TimerKind::Ring => self.config.ring_timeout(),
            TimerKind::Negotiation => self.config.negotiation_timeout(),
        };
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = weak.upgrade() {
                manager.on_timer(generation, kind).await;
            }
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_sender.send(event);
    }
}
