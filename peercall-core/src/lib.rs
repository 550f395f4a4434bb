//! Peercall - single-peer WebRTC calls over a socket.io signaling channel
//!
//! This library negotiates one audio/video call at a time between the local
//! user and a remote user. It features:
//!
//! - **Call Session Manager**: ringing, accept/reject, SDP offer/answer, ICE
//!   relay, mute toggles and teardown as one state machine
//! - **Socket.io Signaling**: an Engine.IO v4 websocket client carrying the
//!   named call events
//! - **Pluggable Collaborators**: media capture and peer links behind traits,
//!   with `webrtc`-crate defaults
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::{CallService, TransportConfig, UserId, WebSocketTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! // Create signaling transport
//! let transport = Arc::new(WebSocketTransport::new(TransportConfig::new(
//!     "https://chat.example.org",
//! )));
//!
//! // Create and start the call service
//! let service = CallService::builder(UserId::new("alice"), transport).build();
//! service.start().await?;
//!
//! // Call bob with the default media (audio + video)
//! service.call(UserId::new("bob")).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// User identity
pub mod identity;

/// Signaling protocol and handlers
pub mod signaling;

/// Engine.IO / Socket.IO packet codec
pub mod socketio;

/// Socket.io websocket transport
pub mod transport;

/// Media capture and tracks
pub mod media;

/// Peer link abstraction and WebRTC implementation
pub mod peer;

/// Call session management
pub mod call;

/// Call service and builder
pub mod service;

// Re-export main types at crate root
pub use call::{CallError, CallManagerConfig, CallSessionManager};
pub use identity::UserId;
pub use media::{
    AudioDevice, MediaCapture, MediaCaptureProvider, MediaError, MediaTrack,
    SampleCaptureProvider, TrackKind, VideoDevice,
};
pub use peer::{PeerLink, PeerLinkError, PeerLinkEvent, PeerLinkFactory, WebRtcPeerLinkFactory};
pub use service::{CallService, CallServiceBuilder, ServiceConfig, ServiceError};
pub use signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
pub use transport::{TransportConfig, TransportError, WebSocketTransport};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallManagerConfig, CallSessionManager};
    pub use crate::identity::UserId;
    pub use crate::media::{MediaCapture, MediaCaptureProvider, TrackKind};
    pub use crate::service::{CallService, CallServiceBuilder, ServiceConfig};
    pub use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
    pub use crate::transport::{TransportConfig, WebSocketTransport};
    pub use crate::types::{CallEvent, CallState, EndReason, MediaPreferences};
}
