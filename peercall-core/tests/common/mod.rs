//! Shared fixtures: an in-memory signaling relay and mock collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use peercall_core::signaling::{
    CallAnsweredPayload, EndCallPayload, IncomingCallPayload, SignalingHandler,
};
use peercall_core::{
    CallEvent, CallManagerConfig, CallSessionManager, CallState, IceCandidate, IceServer,
    MediaCapture, MediaCaptureProvider, MediaError, MediaPreferences, MediaTrack, PeerLink,
    PeerLinkError, PeerLinkFactory, SessionDescription, SignalingMessage, SignalingTransport,
    TrackKind, UserId,
};
use peercall_core::peer::PeerLinkObserver;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug)]
pub struct RelayError(pub String);

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "relay error: {}", self.0)
    }
}

impl std::error::Error for RelayError {}

/// Routes events between users the way the chat server does
#[derive(Default)]
pub struct Relay {
    mailboxes: parking_lot::Mutex<HashMap<UserId, mpsc::UnboundedSender<SignalingMessage>>>,
    log: parking_lot::Mutex<Vec<(UserId, SignalingMessage)>>,
}

impl Relay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a user and return its transport
    pub fn endpoint(self: &Arc<Self>, user: impl Into<UserId>) -> Arc<RelayTransport> {
        let user = user.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.lock().insert(user.clone(), tx);
        Arc::new(RelayTransport {
            user,
            relay: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
            connected: AtomicBool::new(true),
        })
    }

    /// Deliver a message to a user as if the server sent it
    pub fn inject(&self, to: &UserId, message: SignalingMessage) {
        if let Some(tx) = self.mailboxes.lock().get(to) {
            let _ = tx.send(message);
        }
    }

    /// Every message sent through the relay, with its sender
    pub fn log(&self) -> Vec<(UserId, SignalingMessage)> {
        self.log.lock().clone()
    }

    /// Event names sent by one user, in order
    pub fn sent_by(&self, user: &UserId) -> Vec<&'static str> {
        self.log
            .lock()
            .iter()
            .filter(|(from, _)| from == user)
            .map(|(_, message)| message.event_name())
            .collect()
    }

    fn route(&self, from: &UserId, message: SignalingMessage) {
        self.log.lock().push((from.clone(), message.clone()));

        let (to, delivered) = match message {
            SignalingMessage::CallUser(p) => (
                p.to_user_id,
                SignalingMessage::IncomingCall(IncomingCallPayload {
                    from_user_id: p.from_user_id,
                    media: p.media,
                }),
            ),
            SignalingMessage::AnswerCall(p) => (
                p.to_user_id,
                SignalingMessage::CallAnswered(CallAnsweredPayload { accept: p.accept }),
            ),
            SignalingMessage::WebrtcOffer(mut p) => match p.to_user_id.take() {
                Some(to) => (to, SignalingMessage::WebrtcOffer(p)),
                None => return,
            },
            SignalingMessage::WebrtcAnswer(mut p) => match p.to_user_id.take() {
                Some(to) => (to, SignalingMessage::WebrtcAnswer(p)),
                None => return,
            },
            SignalingMessage::WebrtcIce(mut p) => match p.to_user_id.take() {
                Some(to) => (to, SignalingMessage::WebrtcIce(p)),
                None => return,
            },
            SignalingMessage::EndCall(p) => match p.to_user_id {
                Some(to) => (to, SignalingMessage::CallEnded(EndCallPayload::default())),
                None => return,
            },
            _ => return,
        };
        self.inject(&to, delivered);
    }
}

/// One user's connection to the relay
pub struct RelayTransport {
    user: UserId,
    relay: Arc<Relay>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingMessage>>,
    connected: AtomicBool,
}

#[async_trait]
impl SignalingTransport for RelayTransport {
    type Error = RelayError;

    async fn connect(&self) -> Result<(), RelayError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        self.connected.store(false, Ordering::SeqCst);
        self.relay.mailboxes.lock().remove(&self.user);
        Ok(())
    }

    async fn send_message(&self, message: SignalingMessage) -> Result<(), RelayError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RelayError("not connected".to_string()));
        }
        self.relay.route(&self.user, message);
        Ok(())
    }

    async fn receive_message(&self) -> Result<Option<SignalingMessage>, RelayError> {
        Ok(self.inbox.lock().await.recv().await)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Peer link that records what the manager does to it
#[derive(Default)]
pub struct MockLink {
    pub candidates: parking_lot::Mutex<Vec<IceCandidate>>,
    pub tracks: AtomicUsize,
    pub closed: AtomicBool,
}

#[async_trait]
impl PeerLink for MockLink {
    async fn add_track(&self, _track: &MediaTrack) -> Result<(), PeerLinkError> {
        self.tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerLinkError> {
        Ok(SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerLinkError> {
        Ok(SessionDescription::answer("v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\n"))
    }

    async fn set_local_description(&self, _desc: &SessionDescription) -> Result<(), PeerLinkError> {
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _desc: &SessionDescription,
    ) -> Result<(), PeerLinkError> {
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerLinkError> {
        self.candidates.lock().push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerLinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MockLink`]s and keeping the observers
#[derive(Default)]
pub struct MockLinkFactory {
    pub links: parking_lot::Mutex<Vec<Arc<MockLink>>>,
    pub observers: parking_lot::Mutex<Vec<PeerLinkObserver>>,
}

impl MockLinkFactory {
    pub fn created(&self) -> usize {
        self.links.lock().len()
    }

    pub fn last(&self) -> Option<Arc<MockLink>> {
        self.links.lock().last().cloned()
    }

    pub fn last_observer(&self) -> Option<PeerLinkObserver> {
        self.observers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerLinkFactory for MockLinkFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        observer: PeerLinkObserver,
    ) -> Result<Arc<dyn PeerLink>, PeerLinkError> {
        let link = Arc::new(MockLink::default());
        self.links.lock().push(link.clone());
        self.observers.lock().push(observer);
        Ok(link)
    }
}

/// Capture provider producing detached tracks
pub struct DetachedCaptureProvider;

#[async_trait]
impl MediaCaptureProvider for DetachedCaptureProvider {
    async fn acquire(&self, media: MediaPreferences) -> Result<MediaCapture, MediaError> {
        if media.is_empty() {
            return Err(MediaError::NothingRequested);
        }
        let mut capture = MediaCapture::new();
        if media.audio {
            capture.add_track(MediaTrack::detached("local-audio", TrackKind::Audio));
        }
        if media.video {
            capture.add_track(MediaTrack::detached("local-video", TrackKind::Video));
        }
        Ok(capture)
    }
}

pub struct Peer {
    pub user: UserId,
    pub manager: Arc<CallSessionManager<RelayTransport>>,
    pub links: Arc<MockLinkFactory>,
    pub events: broadcast::Receiver<CallEvent>,
}

/// Started manager with mock collaborators attached to the relay
pub fn mock_peer(relay: &Arc<Relay>, user: &str) -> Peer {
    mock_peer_with(relay, user, CallManagerConfig::default())
}

pub fn mock_peer_with(relay: &Arc<Relay>, user: &str, config: CallManagerConfig) -> Peer {
    let user = UserId::new(user);
    let transport = relay.endpoint(user.clone());
    let links = Arc::new(MockLinkFactory::default());
    let manager = CallSessionManager::new(
        user.clone(),
        Arc::new(SignalingHandler::new(transport)),
        Arc::new(DetachedCaptureProvider),
        links.clone(),
        config,
    );
    let events = manager.subscribe_events();
    manager.start().unwrap();
    Peer {
        user,
        manager,
        links,
        events,
    }
}

/// Wait for an event matching `pred`, skipping others
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<CallEvent>, pred: F) -> CallEvent
where
    F: Fn(&CallEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap()
}

/// Poll until the manager reaches a state matching `pred`
pub async fn wait_for_state<T, F>(manager: &CallSessionManager<T>, pred: F) -> CallState
where
    T: SignalingTransport,
    F: Fn(&CallState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let state = manager.state().await;
            if pred(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}
