//! Peer link
//!
//! One [`PeerLink`] is created per call attempt and never reused. Callbacks
//! from the underlying peer connection are delivered to the owner as
//! [`PeerLinkEvent`]s tagged with the link id, so events from a link that has
//! since been replaced can be recognised and dropped.

use crate::media::{MediaTrack, TrackKind, TrackSource};
use crate::types::{IceCandidate, IceServer, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Peer link errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerLinkError {
    /// The peer connection could not be created
    #[error("Failed to create peer connection: {0}")]
    Creation(String),

    /// Offer/answer generation or description setting failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// A local track could not be attached
    #[error("Failed to add track: {0}")]
    Track(String),

    /// A remote candidate was rejected
    #[error("Failed to add ICE candidate: {0}")]
    Candidate(String),

    /// The link was already closed
    #[error("Peer link closed")]
    Closed,
}

/// Notification from a peer link to its owner
#[derive(Debug, Clone)]
pub enum PeerLinkEvent {
    /// Local ICE agent found a candidate, `None` at the end of gathering
    LocalCandidate(Option<IceCandidate>),
    /// The remote side added a track
    RemoteTrack(MediaTrack),
    /// Transport connected
    Connected,
    /// Transport failed and will not recover
    ConnectionFailed,
}

/// Sender half handed to a new link for its callbacks
#[derive(Debug, Clone)]
pub struct PeerLinkObserver {
    link_id: u64,
    tx: mpsc::UnboundedSender<(u64, PeerLinkEvent)>,
}

impl PeerLinkObserver {
    /// Create an observer for the given link id
    #[must_use]
    pub fn new(link_id: u64, tx: mpsc::UnboundedSender<(u64, PeerLinkEvent)>) -> Self {
        Self { link_id, tx }
    }

    /// Link id this observer reports for
    #[must_use]
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Forward an event, ignoring a closed receiver
    pub fn emit(&self, event: PeerLinkEvent) {
        let _ = self.tx.send((self.link_id, event));
    }
}

/// Negotiated transport between the local and the remote user
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach a local track
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerLinkError>;

    /// Generate an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerLinkError>;

    /// Generate an SDP answer to the current remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerLinkError>;

    /// Apply a locally generated description
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), PeerLinkError>;

    /// Apply the remote side's description
    async fn set_remote_description(&self, desc: &SessionDescription)
        -> Result<(), PeerLinkError>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerLinkError>;

    /// Close the link; further calls fail with `Closed`
    async fn close(&self) -> Result<(), PeerLinkError>;
}

/// Creates peer links
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Create a new link that reports through `observer`
    async fn create(
        &self,
        ice_servers: &[IceServer],
        observer: PeerLinkObserver,
    ) -> Result<Arc<dyn PeerLink>, PeerLinkError>;
}

/// Peer link backed by an `RTCPeerConnection`
pub struct WebRtcPeerLink {
    connection: Arc<RTCPeerConnection>,
}

impl WebRtcPeerLink {
    /// Underlying peer connection
    #[must_use]
    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.connection
    }

    fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, PeerLinkError> {
        let result = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        };
        result.map_err(|e| PeerLinkError::Negotiation(format!("Invalid SDP: {e}")))
    }

    fn install_callbacks(connection: &RTCPeerConnection, observer: &PeerLinkObserver) {
        let ice_observer = observer.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let observer = ice_observer.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to serialize local candidate");
                            return;
                        }
                    },
                    None => None,
                };
                observer.emit(PeerLinkEvent::LocalCandidate(candidate));
            })
        }));

        let track_observer = observer.clone();
        connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let observer = track_observer.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => {
                            tracing::warn!(track_id = %track.id(), "Ignoring track of unspecified kind");
                            return;
                        }
                    };
                    let id = track.id();
                    observer.emit(PeerLinkEvent::RemoteTrack(MediaTrack::new(
                        id,
                        kind,
                        TrackSource::Remote(track),
                    )));
                })
            },
        ));

        let state_observer = observer.clone();
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let observer = state_observer.clone();
                Box::pin(async move {
                    tracing::debug!(link_id = observer.link_id(), state = %state, "Peer connection state changed");
                    match state {
                        RTCPeerConnectionState::Connected => observer.emit(PeerLinkEvent::Connected),
                        RTCPeerConnectionState::Failed => {
                            observer.emit(PeerLinkEvent::ConnectionFailed);
                        }
                        _ => {}
                    }
                })
            },
        ));
    }
}

#[async_trait]
impl PeerLink for WebRtcPeerLink {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerLinkError> {
        let TrackSource::Local(local) = track.source() else {
            return Err(PeerLinkError::Track(format!(
                "{} is not a local track",
                track.id()
            )));
        };
        let local: Arc<dyn TrackLocal + Send + Sync> = local.clone();
        self.connection
            .add_track(local)
            .await
            .map_err(|e| PeerLinkError::Track(e.to_string()))?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerLinkError> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| PeerLinkError::Negotiation(format!("Failed to create offer: {e}")))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerLinkError> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| PeerLinkError::Negotiation(format!("Failed to create answer: {e}")))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), PeerLinkError> {
        self.connection
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| {
                PeerLinkError::Negotiation(format!("Failed to set local description: {e}"))
            })
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), PeerLinkError> {
        self.connection
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| {
                PeerLinkError::Negotiation(format!("Failed to set remote description: {e}"))
            })
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerLinkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerLinkError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerLinkError> {
        self.connection
            .close()
            .await
            .map_err(|_| PeerLinkError::Closed)
    }
}

/// Factory for [`WebRtcPeerLink`] with default codecs and interceptors
#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerLinkFactory;

impl WebRtcPeerLinkFactory {
    /// Create the factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcPeerLinkFactory {
    #[tracing::instrument(skip(self, ice_servers, observer), fields(link_id = observer.link_id()))]
    async fn create(
        &self,
        ice_servers: &[IceServer],
        observer: PeerLinkObserver,
    ) -> Result<Arc<dyn PeerLink>, PeerLinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerLinkError::Creation(format!("Failed to register codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| {
                PeerLinkError::Creation(format!("Failed to register interceptors: {e}"))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let connection = Arc::new(api.new_peer_connection(config).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to create peer connection");
            PeerLinkError::Creation(e.to_string())
        })?);

        WebRtcPeerLink::install_callbacks(&connection, &observer);
        tracing::debug!("Created peer connection");

        Ok(Arc::new(WebRtcPeerLink { connection }))
    }
}
