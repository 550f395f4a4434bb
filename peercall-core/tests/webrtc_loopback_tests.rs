//! Call setup with real `webrtc` peer connections on both sides

mod common;

use common::{wait_for_event, wait_for_state, Relay};
use peercall_core::{
    CallEvent, CallManagerConfig, CallService, CallState, MediaPreferences, ServiceConfig,
    TrackKind, UserId,
};

fn loopback_config() -> ServiceConfig {
    ServiceConfig {
        default_media: MediaPreferences::audio_only(),
        call_config: CallManagerConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn real_peer_connections_negotiate() {
    let relay = Relay::new();
    let alice = CallService::builder(UserId::new("alice"), relay.endpoint("alice"))
        .with_config(loopback_config())
        .build();
    let bob = CallService::builder(UserId::new("bob"), relay.endpoint("bob"))
        .with_config(loopback_config())
        .build();
    alice.start().await.unwrap();
    bob.start().await.unwrap();
    let mut bob_events = bob.subscribe_events();

    alice.call(UserId::new("bob")).await.unwrap();
    wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    bob.accept_call().await.unwrap();

    wait_for_state(alice.manager(), CallState::is_active).await;
    wait_for_state(bob.manager(), CallState::is_active).await;

    let local = alice.local_capture().await;
    assert_eq!(local.audio_tracks().count(), 1);
    assert_eq!(local.video_tracks().count(), 0);
    assert!(local.tracks().iter().all(|t| t.kind() == TrackKind::Audio));

    alice.end_call().await.unwrap();
    wait_for_state(bob.manager(), CallState::is_idle).await;
    assert_eq!(alice.local_capture().await.live_track_count(), 0);
    assert_eq!(bob.local_capture().await.live_track_count(), 0);

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}
