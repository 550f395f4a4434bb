//! Signaling validation and edge case tests

mod common;

use common::{mock_peer, wait_for_event, Relay};
use peercall_core::signaling::{
    AnswerCallPayload, AnswerPayload, CallAnsweredPayload, EndCallPayload, IcePayload,
    IncomingCallPayload, OfferPayload, SignalingError,
};
use peercall_core::{
    CallEvent, CallState, IceCandidate, MediaPreferences, SessionDescription, SignalingMessage,
    UserId,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

#[test]
fn unknown_event_is_rejected() {
    let res = SignalingMessage::from_event("chat-message", Some(json!({"text": "hi"})));
    assert!(matches!(res, Err(SignalingError::UnknownEvent(ref name)) if name == "chat-message"));
}

#[test]
fn incoming_call_requires_caller() {
    let res = SignalingMessage::from_event(
        "incoming-call",
        Some(json!({"media": {"audio": true, "video": false}})),
    );
    assert!(
        matches!(res, Err(SignalingError::InvalidPayload { ref event, .. }) if event == "incoming-call")
    );
}

#[test]
fn numeric_ids_are_echoed_as_numbers() {
    let incoming = SignalingMessage::from_event(
        "incoming-call",
        Some(json!({"fromUserId": 17, "media": {"audio": true, "video": true}})),
    )
    .unwrap();
    let SignalingMessage::IncomingCall(IncomingCallPayload { from_user_id, .. }) = incoming else {
        panic!("expected incoming-call");
    };
    assert_eq!(from_user_id, UserId::Numeric(17));

    let reply = SignalingMessage::AnswerCall(AnswerCallPayload {
        from_user_id: UserId::new("bob"),
        to_user_id: from_user_id,
        accept: true,
    });
    let (name, data) = reply.to_event().unwrap();
    assert_eq!(name, "answer-call");
    assert_eq!(
        data,
        json!({"fromUserId": "bob", "toUserId": 17, "accept": true})
    );
}

#[test]
fn call_ended_without_payload() {
    assert_eq!(
        SignalingMessage::from_event("call-ended", None).unwrap(),
        SignalingMessage::CallEnded(EndCallPayload::default())
    );
    assert_eq!(
        SignalingMessage::from_event("call-ended", Some(serde_json::Value::Null)).unwrap(),
        SignalingMessage::CallEnded(EndCallPayload::default())
    );
}

#[test]
fn null_ice_candidate_decodes() {
    let msg = assert_ok!(SignalingMessage::from_event(
        "webrtc-ice",
        Some(json!({"candidate": null}))
    ));
    assert_eq!(
        msg,
        SignalingMessage::WebrtcIce(IcePayload {
            to_user_id: None,
            candidate: None,
        })
    );
}

#[test]
fn browser_candidate_shape_decodes() {
    let msg = SignalingMessage::from_event(
        "webrtc-ice",
        Some(json!({
            "candidate": {
                "candidate": "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "EsXj"
            }
        })),
    )
    .unwrap();
    let SignalingMessage::WebrtcIce(IcePayload {
        candidate: Some(candidate),
        ..
    }) = msg
    else {
        panic!("expected a candidate");
    };
    assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
    assert_eq!(candidate.sdp_mline_index, Some(0));
    assert!(!candidate.is_end_of_candidates());
}

#[test]
fn offer_without_sdp_is_invalid() {
    let err = assert_err!(SignalingMessage::from_event(
        "webrtc-offer",
        Some(json!({"offer": {"type": "offer"}}))
    ));
    assert!(matches!(err, SignalingError::InvalidPayload { .. }));
}

#[tokio::test]
async fn stray_events_leave_idle_manager_untouched() {
    let relay = Relay::new();
    let mut alice = mock_peer(&relay, "alice");

    let strays = [
        SignalingMessage::CallAnswered(CallAnsweredPayload { accept: true }),
        SignalingMessage::WebrtcOffer(OfferPayload {
            to_user_id: None,
            offer: SessionDescription::offer("v=0\r\n"),
        }),
        SignalingMessage::WebrtcAnswer(AnswerPayload {
            to_user_id: None,
            answer: SessionDescription::answer("v=0\r\n"),
        }),
        SignalingMessage::WebrtcIce(IcePayload {
            to_user_id: None,
            candidate: Some(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host")),
        }),
        SignalingMessage::CallEnded(EndCallPayload::default()),
    ];
    for message in strays {
        relay.inject(&alice.user, message);
    }

    // Processed in order, so everything above has been handled once this rings
    relay.inject(
        &alice.user,
        SignalingMessage::IncomingCall(IncomingCallPayload {
            from_user_id: UserId::new("carol"),
            media: MediaPreferences::audio_only(),
        }),
    );
    wait_for_event(&mut alice.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;

    assert_eq!(
        alice.manager.state().await,
        CallState::IncomingOffered {
            from_user_id: UserId::new("carol"),
            media: MediaPreferences::audio_only(),
        }
    );
    assert_eq!(alice.links.created(), 0);
    assert!(relay.sent_by(&alice.user).is_empty());
}
