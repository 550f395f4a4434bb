//! Call service orchestration

use crate::call::{CallError, CallManagerConfig, CallSessionManager};
use crate::identity::UserId;
use crate::media::{MediaCapture, MediaCaptureProvider, SampleCaptureProvider};
use crate::peer::{PeerLinkFactory, WebRtcPeerLinkFactory};
use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::{CallEvent, CallState, MediaPreferences, ToggleState};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Signaling transport failed to connect or disconnect
    #[error("Transport error: {0}")]
    Transport(String),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Service configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Media used by [`CallService::call`]
    pub default_media: MediaPreferences,
    /// Call manager config
    pub call_config: CallManagerConfig,
}

/// Main call service: one transport, one call manager
pub struct CallService<T: SignalingTransport> {
    transport: Arc<T>,
    signaling: Arc<SignalingHandler<T>>,
    manager: Arc<CallSessionManager<T>>,
    config: ServiceConfig,
    started: AtomicBool,
}

impl<T: SignalingTransport> CallService<T> {
    /// Create a builder
    #[must_use]
    pub fn builder(local_user: UserId, transport: Arc<T>) -> CallServiceBuilder<T> {
        CallServiceBuilder::new(local_user, transport)
    }

    /// Connect, announce presence and start handling calls
    ///
    /// A failed start leaves the service stopped, so `start` may be retried.
    /// After [`shutdown`](Self::shutdown) the service can be started again.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot connect, presence cannot be
    /// announced or the service was already started
    #[tracing::instrument(skip(self), fields(user = %self.manager.local_user()))]
    pub async fn start(&self) -> Result<(), ServiceError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CallError::InvalidState("service already started".to_string()).into());
        }
        tracing::info!("Starting call service");

        if let Err(e) = self.bring_up().await {
            self.started.store(false, Ordering::SeqCst);
            tracing::warn!(error = %e, "Call service failed to start");
            return Err(e);
        }

        tracing::info!("Call service started successfully");
        Ok(())
    }

    async fn bring_up(&self) -> Result<(), ServiceError> {
        self.transport
            .connect()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let announced = self
            .signaling
            .send_message(SignalingMessage::UserOnline(
                self.manager.local_user().clone(),
            ))
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()));
        let started = announced.and_then(|()| self.manager.start().map_err(ServiceError::from));

        if started.is_err() {
            if let Err(e) = self.transport.disconnect().await {
                tracing::debug!(error = %e, "Disconnect after failed start");
            }
        }
        started
    }

    /// End any call, stop the manager and close the transport
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to disconnect
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.manager.dispose().await;
        self.transport
            .disconnect()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("Call service stopped");
        Ok(())
    }

    /// Call a user with the configured default media
    ///
    /// # Errors
    ///
    /// Returns error if call cannot be placed
    pub async fn call(&self, to_user_id: UserId) -> Result<(), ServiceError> {
        self.call_with_media(to_user_id, self.config.default_media)
            .await
    }

    /// Call a user
    ///
    /// # Errors
    ///
    /// Returns error if call cannot be placed
    pub async fn call_with_media(
        &self,
        to_user_id: UserId,
        media: MediaPreferences,
    ) -> Result<(), ServiceError> {
        Ok(self.manager.place_call(to_user_id, media).await?)
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing or media fails
    pub async fn accept_call(&self) -> Result<(), ServiceError> {
        Ok(self.manager.accept_call().await?)
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing
    pub async fn reject_call(&self) -> Result<(), ServiceError> {
        Ok(self.manager.reject_call().await?)
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be ended
    pub async fn end_call(&self) -> Result<(), ServiceError> {
        Ok(self.manager.end_call().await?)
    }

    /// Flip the microphone
    pub async fn toggle_mic(&self) -> bool {
        self.manager.toggle_mic().await
    }

    /// Flip the camera
    pub async fn toggle_cam(&self) -> bool {
        self.manager.toggle_cam().await
    }

    /// Current call state
    pub async fn state(&self) -> CallState {
        self.manager.state().await
    }

    /// Current toggles
    pub async fn toggles(&self) -> ToggleState {
        self.manager.toggles().await
    }

    /// Local tracks
    pub async fn local_capture(&self) -> MediaCapture {
        self.manager.local_capture().await
    }

    /// Remote tracks
    pub async fn remote_capture(&self) -> MediaCapture {
        self.manager.remote_capture().await
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.manager.subscribe_events()
    }

    /// Underlying call manager
    #[must_use]
    pub fn manager(&self) -> &Arc<CallSessionManager<T>> {
        &self.manager
    }
}

/// Call service builder
pub struct CallServiceBuilder<T: SignalingTransport> {
    local_user: UserId,
    transport: Arc<T>,
    config: ServiceConfig,
    media: Option<Arc<dyn MediaCaptureProvider>>,
    links: Option<Arc<dyn PeerLinkFactory>>,
}

impl<T: SignalingTransport> CallServiceBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(local_user: UserId, transport: Arc<T>) -> Self {
        Self {
            local_user,
            transport,
            config: ServiceConfig::default(),
            media: None,
            links: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom media capture provider
    #[must_use]
    pub fn with_media_provider(mut self, media: Arc<dyn MediaCaptureProvider>) -> Self {
        self.media = Some(media);
        self
    }

    /// Use a custom peer link factory
    #[must_use]
    pub fn with_link_factory(mut self, links: Arc<dyn PeerLinkFactory>) -> Self {
        self.links = Some(links);
        self
    }

    /// Build the service
    #[must_use]
    pub fn build(self) -> CallService<T> {
        let signaling = Arc::new(SignalingHandler::new(self.transport.clone()));
        let media = self
            .media
            .unwrap_or_else(|| Arc::new(SampleCaptureProvider::new()));
        let links = self
            .links
            .unwrap_or_else(|| Arc::new(WebRtcPeerLinkFactory::new()));
        let manager = CallSessionManager::new(
            self.local_user,
            signaling.clone(),
            media,
            links,
            self.config.call_config.clone(),
        );

        CallService {
            transport: self.transport,
            signaling,
            manager,
            config: self.config,
            started: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    #[derive(Debug)]
    struct LoopError;

    impl std::fmt::Display for LoopError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "loop transport error")
        }
    }

    impl std::error::Error for LoopError {}

    #[derive(Default)]
    struct LoopTransport {
        connected: AtomicBool,
        fail_sends: AtomicBool,
        sent: parking_lot::Mutex<Vec<SignalingMessage>>,
        closed: Notify,
    }

    #[async_trait]
    impl SignalingTransport for LoopTransport {
        type Error = LoopError;

        async fn connect(&self) -> Result<(), LoopError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), LoopError> {
            self.connected.store(false, Ordering::SeqCst);
            self.closed.notify_waiters();
            Ok(())
        }

        async fn send_message(&self, message: SignalingMessage) -> Result<(), LoopError> {
            if !self.connected.load(Ordering::SeqCst) || self.fail_sends.load(Ordering::SeqCst) {
                return Err(LoopError);
            }
            self.sent.lock().push(message);
            Ok(())
        }

        async fn receive_message(&self) -> Result<Option<SignalingMessage>, LoopError> {
            self.closed.notified().await;
            Ok(None)
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_start_announces_presence() {
        let transport = Arc::new(LoopTransport::default());
        let service = CallService::builder(UserId::new("alice"), transport.clone()).build();

        service.start().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(
            transport.sent.lock().as_slice(),
            &[SignalingMessage::UserOnline(UserId::new("alice"))]
        );

        assert!(service.start().await.is_err());

        service.shutdown().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_failed_announce_allows_retry() {
        let transport = Arc::new(LoopTransport::default());
        transport.fail_sends.store(true, Ordering::SeqCst);
        let service = CallService::builder(UserId::new("alice"), transport.clone()).build();

        assert!(matches!(
            service.start().await,
            Err(ServiceError::Transport(_))
        ));
        assert!(!transport.is_connected());

        transport.fail_sends.store(false, Ordering::SeqCst);
        service.start().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(
            transport.sent.lock().as_slice(),
            &[SignalingMessage::UserOnline(UserId::new("alice"))]
        );

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_after_shutdown() {
        let transport = Arc::new(LoopTransport::default());
        let service = CallService::builder(UserId::new("alice"), transport.clone()).build();

        service.start().await.unwrap();
        service.shutdown().await.unwrap();
        service.start().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.sent.lock().len(), 2);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_with_default_stack() {
        let transport = Arc::new(LoopTransport::default());
        let config = ServiceConfig {
            default_media: MediaPreferences::audio_only(),
            call_config: CallManagerConfig {
                ice_servers: Vec::new(),
                ..Default::default()
            },
        };
        let service = CallService::builder(UserId::new("alice"), transport.clone())
            .with_config(config)
            .build();
        service.start().await.unwrap();

        service.call(UserId::Numeric(2)).await.unwrap();
        assert!(matches!(service.state().await, CallState::Outgoing { .. }));
        assert_eq!(service.local_capture().await.live_track_count(), 1);

        assert!(!service.toggle_mic().await);
        assert!(!service.toggles().await.mic_on);

        service.end_call().await.unwrap();
        assert_eq!(service.state().await, CallState::Idle);
        assert_eq!(service.local_capture().await.live_track_count(), 0);

        let names: Vec<_> = transport
            .sent
            .lock()
            .iter()
            .map(SignalingMessage::event_name)
            .collect();
        assert_eq!(names, vec!["user-online", "call-user", "end-call"]);

        service.shutdown().await.unwrap();
    }
}
