//! Call types and data structures

use crate::identity::UserId;
use serde::{Deserialize, Serialize};

/// Media requested for a call
///
/// Chosen by the caller and echoed to the callee unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaPreferences {
    /// Capture and send audio
    pub audio: bool,
    /// Capture and send video
    pub video: bool,
}

impl MediaPreferences {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if nothing at all is requested
    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

impl Default for MediaPreferences {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Call state enumeration
///
/// ```text
///            place_call                 webrtc-answer
///   Idle ───────────────► Outgoing ─────────────────────┐
///    │                                                  ▼
///    │ incoming-call          accept_call   webrtc-offer
///    └──────────► IncomingOffered ──► Answering ──────► Active
/// ```
///
/// Every state returns to `Idle` on hang-up, rejection, timeout or failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallState {
    /// No call in progress
    Idle,
    /// We called someone and are waiting for them
    Outgoing {
        /// Who is being called
        to_user_id: UserId,
        /// Requested media
        media: MediaPreferences,
    },
    /// Someone is calling us and waits for a decision
    IncomingOffered {
        /// Who is calling
        from_user_id: UserId,
        /// Media requested by the caller
        media: MediaPreferences,
    },
    /// We accepted and wait for the caller's SDP offer
    Answering {
        /// Who is calling
        from_user_id: UserId,
        /// Media requested by the caller
        media: MediaPreferences,
    },
    /// Call is established
    Active {
        /// The other party
        peer_user_id: UserId,
    },
}

impl CallState {
    /// Check if there is no call
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Check if the call is established
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// The remote user this state refers to, if any
    pub fn peer(&self) -> Option<&UserId> {
        match self {
            Self::Idle => None,
            Self::Outgoing { to_user_id, .. } => Some(to_user_id),
            Self::IncomingOffered { from_user_id, .. } | Self::Answering { from_user_id, .. } => {
                Some(from_user_id)
            }
            Self::Active { peer_user_id } => Some(peer_user_id),
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Outgoing { .. } => "outgoing",
            Self::IncomingOffered { .. } => "incoming_offered",
            Self::Answering { .. } => "answering",
            Self::Active { .. } => "active",
        }
    }
}

impl Default for CallState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Microphone and camera switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleState {
    /// Local audio tracks are enabled
    pub mic_on: bool,
    /// Local video tracks are enabled
    pub cam_on: bool,
}

impl Default for ToggleState {
    fn default() -> Self {
        Self {
            mic_on: true,
            cam_on: true,
        }
    }
}

/// SDP type carried by a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Create a candidate from its candidate line only
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// An empty candidate line is the browser's end-of-candidates marker
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// STUN/TURN server handed to every new peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` / `turn:` / `turns:`), a single string or a list
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN server with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Classification of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Local media could not be captured
    MediaAcquisition,
    /// SDP generation or description setting failed
    Negotiation,
    /// The remote side never answered or the connection dropped
    PeerUnreachable,
    /// The signaling channel failed while sending
    Signaling,
}

/// Why a call returned to idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// We hung up
    LocalHangup,
    /// The remote side hung up
    RemoteHangup,
    /// The callee declined our call
    Rejected,
    /// We declined an incoming call
    Declined,
    /// An incoming call rang out without a decision
    Missed,
    /// The call failed
    Failed(FailureKind),
}

/// Call event for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEvent {
    /// The call state changed
    StateChanged {
        /// New state
        state: CallState,
    },
    /// Someone is calling
    IncomingCall {
        /// Caller
        from_user_id: UserId,
        /// Media requested by the caller
        media: MediaPreferences,
    },
    /// A remote track arrived and was added to the remote capture
    RemoteTrackAdded {
        /// Track identifier
        track_id: String,
        /// Track kind
        kind: crate::media::TrackKind,
    },
    /// The call is over
    CallEnded {
        /// The other party, when known
        peer_user_id: Option<UserId>,
        /// Why it ended
        reason: EndReason,
    },
}
