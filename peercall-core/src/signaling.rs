//! Call signaling protocol
//!
//! Named events with JSON payloads exchanged with the signaling server. The
//! server routes each event by the `toUserId` in its payload and renames some
//! of them on the way (`call-user` arrives as `incoming-call`, `answer-call`
//! as `call-answered`, `end-call` as `call-ended`).

use crate::identity::UserId;
use crate::types::{IceCandidate, MediaPreferences, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Event name is not part of the call protocol
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Payload does not match the event's schema
    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload {
        /// Event name
        event: String,
        /// Decoder message
        reason: String,
    },

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// `call-user` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUserPayload {
    /// Caller
    pub from_user_id: UserId,
    /// Callee
    pub to_user_id: UserId,
    /// Requested media
    pub media: MediaPreferences,
}

/// `incoming-call` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    /// Caller
    pub from_user_id: UserId,
    /// Requested media
    pub media: MediaPreferences,
}

/// `answer-call` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerCallPayload {
    /// Callee (us)
    pub from_user_id: UserId,
    /// Caller
    pub to_user_id: UserId,
    /// Whether the call was accepted
    pub accept: bool,
}

/// `call-answered` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAnsweredPayload {
    /// Whether the callee accepted
    pub accept: bool,
}

/// `webrtc-offer` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    /// Recipient, set on send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    /// SDP offer
    pub offer: SessionDescription,
}

/// `webrtc-answer` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    /// Recipient, set on send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    /// SDP answer
    pub answer: SessionDescription,
}

/// `webrtc-ice` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcePayload {
    /// Recipient, set on send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    /// Candidate, `null` marks end of candidates
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
}

/// `end-call` / `call-ended` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCallPayload {
    /// Recipient, set on send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
}

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalingMessage {
    /// Presence announcement sent right after connecting
    #[serde(rename = "user-online")]
    UserOnline(UserId),

    /// Ask the server to ring a user
    #[serde(rename = "call-user")]
    CallUser(CallUserPayload),

    /// Someone is ringing us
    #[serde(rename = "incoming-call")]
    IncomingCall(IncomingCallPayload),

    /// Our decision on an incoming call
    #[serde(rename = "answer-call")]
    AnswerCall(AnswerCallPayload),

    /// The callee's decision on our call
    #[serde(rename = "call-answered")]
    CallAnswered(CallAnsweredPayload),

    /// SDP offer
    #[serde(rename = "webrtc-offer")]
    WebrtcOffer(OfferPayload),

    /// SDP answer
    #[serde(rename = "webrtc-answer")]
    WebrtcAnswer(AnswerPayload),

    /// ICE candidate
    #[serde(rename = "webrtc-ice")]
    WebrtcIce(IcePayload),

    /// Hang up
    #[serde(rename = "end-call")]
    EndCall(EndCallPayload),

    /// The remote side hung up
    #[serde(rename = "call-ended")]
    CallEnded(EndCallPayload),
}

/// Every event name the call protocol understands
pub const CALL_EVENTS: &[&str] = &[
    "user-online",
    "call-user",
    "incoming-call",
    "answer-call",
    "call-answered",
    "webrtc-offer",
    "webrtc-answer",
    "webrtc-ice",
    "end-call",
    "call-ended",
];

impl SignalingMessage {
    /// Wire name of this event
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::UserOnline(_) => "user-online",
            Self::CallUser(_) => "call-user",
            Self::IncomingCall(_) => "incoming-call",
            Self::AnswerCall(_) => "answer-call",
            Self::CallAnswered(_) => "call-answered",
            Self::WebrtcOffer(_) => "webrtc-offer",
            Self::WebrtcAnswer(_) => "webrtc-answer",
            Self::WebrtcIce(_) => "webrtc-ice",
            Self::EndCall(_) => "end-call",
            Self::CallEnded(_) => "call-ended",
        }
    }

    /// Build a message from an event name and its (possibly absent) payload
    ///
    /// # Errors
    ///
    /// Returns `UnknownEvent` for names outside the call protocol and
    /// `InvalidPayload` when the payload does not decode.
    pub fn from_event(name: &str, data: Option<Value>) -> Result<Self, SignalingError> {
        if !CALL_EVENTS.contains(&name) {
            return Err(SignalingError::UnknownEvent(name.to_string()));
        }

        // `call-ended` is emitted without a payload by some servers
        let data = match data {
            Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
            Some(v) => v,
        };

        serde_json::from_value(serde_json::json!({ "event": name, "data": data })).map_err(|e| {
            SignalingError::InvalidPayload {
                event: name.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Split into the event name and its JSON payload
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` if serialization fails
    pub fn to_event(&self) -> Result<(&'static str, Value), SignalingError> {
        let name = self.event_name();
        let mut value = serde_json::to_value(self).map_err(|e| SignalingError::InvalidPayload {
            event: name.to_string(),
            reason: e.to_string(),
        })?;
        let data = value
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok((name, data))
    }
}

/// Signaling transport trait
///
/// Implement this for your specific channel (socket.io, in-memory relay, ...).
/// The transport is constructed and connected by the caller; the call
/// manager only sends and receives through it.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the channel
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Close the channel; pending `receive_message` calls return `Ok(None)`
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Emit a signaling message
    async fn send_message(&self, message: SignalingMessage) -> Result<(), Self::Error>;

    /// Receive the next signaling message, `None` once the channel is closed
    async fn receive_message(&self) -> Result<Option<SignalingMessage>, Self::Error>;

    /// Whether the channel is currently open
    fn is_connected(&self) -> bool;
}

/// Signaling handler with tracing and receive backoff
pub struct SignalingHandler<T: SignalingTransport> {
    transport: std::sync::Arc<T>,
    // Never awaited, so a dequeued message is returned in the same poll
    error_count: AtomicU32,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: std::sync::Arc<T>) -> Self {
        Self {
            transport,
            error_count: AtomicU32::new(0),
        }
    }

    /// Send a signaling message
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(event = message.event_name()))]
    pub async fn send_message(&self, message: SignalingMessage) -> Result<(), T::Error> {
        tracing::debug!("Sending signaling message");
        self.transport.send_message(message).await
    }

    /// Receive a signaling message, backing off after consecutive errors
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    #[tracing::instrument(skip(self))]
    pub async fn receive_message(&self) -> Result<Option<SignalingMessage>, T::Error> {
        match self.transport.receive_message().await {
            Ok(result) => {
                self.error_count.store(0, Ordering::Relaxed);

                if let Some(message) = &result {
                    tracing::debug!(event = message.event_name(), "Received signaling message");
                }
                Ok(result)
            }
            Err(e) => {
                let count = self
                    .error_count
                    .fetch_add(1, Ordering::Relaxed)
                    .saturating_add(1);

                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    error = %e,
                    "Error receiving message, applying backoff"
                );
                sleep(backoff_duration).await;

                Err(e)
            }
        }
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &std::sync::Arc<T> {
        &self.transport
    }
}
