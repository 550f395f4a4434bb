//! Media capture and tracks
//!
//! A [`MediaCapture`] is a container of [`MediaTrack`]s, the local one filled
//! by a [`MediaCaptureProvider`] and the remote one by the peer link as the
//! other side's tracks arrive. Track flags are shared between clones, so a
//! capture handed to the presentation layer observes mute and stop changes
//! made by the call manager.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::types::MediaPreferences;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused access to capture devices
    #[error("Permission to capture media was denied")]
    PermissionDenied,

    /// No device of the requested kind
    #[error("No {0} device available")]
    DeviceUnavailable(TrackKind),

    /// Neither audio nor video was requested
    #[error("At least one of audio or video must be requested")]
    NothingRequested,

    /// Track was stopped
    #[error("Track stopped: {0}")]
    TrackStopped(String),

    /// Track has no local sample sink
    #[error("Track {0} cannot carry local samples")]
    NotLocal(String),

    /// Writing a sample failed
    #[error("Write failed: {0}")]
    WriteFailed(String),
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug)]
struct TrackFlags {
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Where a track's media comes from
#[derive(Clone)]
pub enum TrackSource {
    /// Not bound to any media engine (tests, placeholders)
    Detached,
    /// Local track fed with encoded samples by the application
    Local(Arc<TrackLocalStaticSample>),
    /// Track received from the remote peer
    Remote(Arc<TrackRemote>),
}

impl fmt::Debug for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached => write!(f, "Detached"),
            Self::Local(_) => write!(f, "Local"),
            Self::Remote(_) => write!(f, "Remote"),
        }
    }
}

/// A single audio or video track
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    flags: Arc<TrackFlags>,
    source: TrackSource,
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            kind,
            flags: Arc::new(TrackFlags {
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
            source,
        }
    }

    /// Create a track without a media source
    pub fn detached(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::new(id, kind, TrackSource::Detached)
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Media source
    #[must_use]
    pub fn source(&self) -> &TrackSource {
        &self.source
    }

    /// Whether samples written to this track are sent
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.flags.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track without renegotiation
    pub fn set_enabled(&self, enabled: bool) {
        self.flags.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track has not been stopped
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.flags.live.load(Ordering::SeqCst)
    }

    /// Stop the track permanently
    pub fn stop(&self) {
        if self.flags.live.swap(false, Ordering::SeqCst) {
            tracing::debug!(track_id = %self.id, kind = %self.kind, "Track stopped");
        }
    }

    /// Write one encoded sample to a local track
    ///
    /// Samples written while the track is disabled are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the track is stopped, is not a local track, or the
    /// underlying writer fails.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        if !self.is_live() {
            return Err(MediaError::TrackStopped(self.id.clone()));
        }
        let TrackSource::Local(track) = &self.source else {
            return Err(MediaError::NotLocal(self.id.clone()));
        };
        if !self.is_enabled() {
            tracing::trace!(track_id = %self.id, "Dropping sample for disabled track");
            return Ok(());
        }

        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| MediaError::WriteFailed(e.to_string()))
    }
}

/// A set of tracks belonging to one side of a call
#[derive(Debug, Clone)]
pub struct MediaCapture {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaCapture {
    /// Create an empty capture with a random stream id
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Create an empty capture with the given stream id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a track
    pub fn add_track(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Tracks of one kind
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Audio tracks
    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    /// Video tracks
    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    /// Number of tracks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Check if there are no tracks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Number of tracks that have not been stopped
    #[must_use]
    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Set `enabled` on every live track of a kind, returning how many changed
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut count = 0;
        for track in self.tracks_of(kind).filter(|t| t.is_live()) {
            track.set_enabled(enabled);
            count += 1;
        }
        count
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Default for MediaCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of local media for a call
#[async_trait]
pub trait MediaCaptureProvider: Send + Sync {
    /// Acquire local tracks for the requested media
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied`, `DeviceUnavailable` or `NothingRequested`
    async fn acquire(&self, media: MediaPreferences) -> Result<MediaCapture, MediaError>;
}

/// Audio device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
}

/// Video device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
}

/// Capture provider producing sample-fed opus and VP8 tracks
///
/// The application writes encoded frames through [`MediaTrack::write_sample`];
/// the provider only decides which tracks exist based on the devices it was
/// configured with.
#[derive(Debug, Clone)]
pub struct SampleCaptureProvider {
    audio_devices: Vec<AudioDevice>,
    video_devices: Vec<VideoDevice>,
    permission_granted: bool,
}

impl SampleCaptureProvider {
    /// Provider with one default microphone and one default camera
    #[must_use]
    pub fn new() -> Self {
        Self {
            audio_devices: vec![AudioDevice {
                id: "default-audio".to_string(),
                name: "Default Audio Device".to_string(),
            }],
            video_devices: vec![VideoDevice {
                id: "default-video".to_string(),
                name: "Default Video Device".to_string(),
            }],
            permission_granted: true,
        }
    }

    /// Provider with an explicit device list
    #[must_use]
    pub fn with_devices(audio_devices: Vec<AudioDevice>, video_devices: Vec<VideoDevice>) -> Self {
        Self {
            audio_devices,
            video_devices,
            permission_granted: true,
        }
    }

    /// Refuse every acquisition as if the user denied access
    #[must_use]
    pub fn deny_permission(mut self) -> Self {
        self.permission_granted = false;
        self
    }

    /// Available audio devices
    #[must_use]
    pub fn audio_devices(&self) -> &[AudioDevice] {
        &self.audio_devices
    }

    /// Available video devices
    #[must_use]
    pub fn video_devices(&self) -> &[VideoDevice] {
        &self.video_devices
    }

    fn sample_track(kind: TrackKind, stream_id: &str) -> MediaTrack {
        let track_id = format!("{kind}-{}", Uuid::new_v4().simple());
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
        };
        tracing::debug!(track_id = %track_id, codec = %codec.mime_type, clock_rate = codec.clock_rate, "Track codec configured");

        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            track_id.clone(),
            stream_id.to_string(),
        ));
        MediaTrack::new(track_id, kind, TrackSource::Local(track))
    }
}

impl Default for SampleCaptureProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaCaptureProvider for SampleCaptureProvider {
    #[tracing::instrument(skip(self))]
    async fn acquire(&self, media: MediaPreferences) -> Result<MediaCapture, MediaError> {
        if media.is_empty() {
            return Err(MediaError::NothingRequested);
        }
        if !self.permission_granted {
            tracing::warn!("Media capture permission denied");
            return Err(MediaError::PermissionDenied);
        }
        if media.audio && self.audio_devices.is_empty() {
            return Err(MediaError::DeviceUnavailable(TrackKind::Audio));
        }
        if media.video && self.video_devices.is_empty() {
            return Err(MediaError::DeviceUnavailable(TrackKind::Video));
        }

        let mut capture = MediaCapture::new();
        if media.audio {
            let track = Self::sample_track(TrackKind::Audio, capture.id());
            capture.add_track(track);
        }
        if media.video {
            let track = Self::sample_track(TrackKind::Video, capture.id());
            capture.add_track(track);
        }

        tracing::info!(stream_id = %capture.id(), tracks = capture.len(), "Local media acquired");
        Ok(capture)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_track_flags_shared_between_clones() {
        let track = MediaTrack::detached("a1", TrackKind::Audio);
        let view = track.clone();

        track.set_enabled(false);
        assert!(!view.is_enabled());

        view.stop();
        assert!(!track.is_live());
    }

    #[test]
    fn test_capture_set_enabled_by_kind() {
        let mut capture = MediaCapture::with_id("local");
        capture.add_track(MediaTrack::detached("a1", TrackKind::Audio));
        capture.add_track(MediaTrack::detached("v1", TrackKind::Video));
        capture.add_track(MediaTrack::detached("a2", TrackKind::Audio));

        assert_eq!(capture.set_enabled(TrackKind::Audio, false), 2);
        assert!(capture.audio_tracks().all(|t| !t.is_enabled()));
        assert!(capture.video_tracks().all(MediaTrack::is_enabled));
    }

    #[test]
    fn test_capture_stop_all() {
        let mut capture = MediaCapture::new();
        capture.add_track(MediaTrack::detached("a1", TrackKind::Audio));
        capture.add_track(MediaTrack::detached("v1", TrackKind::Video));
        assert_eq!(capture.live_track_count(), 2);

        let snapshot = capture.clone();
        capture.stop_all();
        assert_eq!(snapshot.live_track_count(), 0);
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_write_sample_rules() {
        let detached = MediaTrack::detached("a1", TrackKind::Audio);
        let err = detached
            .write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::NotLocal("a1".to_string()));

        detached.stop();
        let err = detached
            .write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::TrackStopped("a1".to_string()));
    }

    #[tokio::test]
    async fn test_disabled_local_track_drops_samples() {
        let provider = SampleCaptureProvider::new();
        let capture = provider
            .acquire(MediaPreferences::audio_only())
            .await
            .unwrap();
        let track = capture.audio_tracks().next().unwrap().clone();
        track.set_enabled(false);

        let result = track
            .write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_sample_provider_acquire() {
        let provider = SampleCaptureProvider::new();
        let capture = provider
            .acquire(MediaPreferences::video_call())
            .await
            .unwrap();

        assert_eq!(capture.len(), 2);
        assert_eq!(capture.audio_tracks().count(), 1);
        assert_eq!(capture.video_tracks().count(), 1);
        assert!(capture
            .tracks()
            .iter()
            .all(|t| matches!(t.source(), TrackSource::Local(_))));
    }

    #[tokio::test]
    async fn test_sample_provider_errors() {
        let provider = SampleCaptureProvider::new();
        let none = MediaPreferences {
            audio: false,
            video: false,
        };
        assert_eq!(
            provider.acquire(none).await.unwrap_err(),
            MediaError::NothingRequested
        );

        let denied = SampleCaptureProvider::new().deny_permission();
        assert_eq!(
            denied
                .acquire(MediaPreferences::audio_only())
                .await
                .unwrap_err(),
            MediaError::PermissionDenied
        );

        let no_camera = SampleCaptureProvider::with_devices(
            provider.audio_devices().to_vec(),
            Vec::new(),
        );
        assert!(no_camera
            .acquire(MediaPreferences::audio_only())
            .await
            .is_ok());
        assert_eq!(
            no_camera
                .acquire(MediaPreferences::video_call())
                .await
                .unwrap_err(),
            MediaError::DeviceUnavailable(TrackKind::Video)
        );
    }
}
