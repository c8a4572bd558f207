//! Local media capture and controls
//!
//! [`LocalMediaController`] exclusively owns the captured tracks. The
//! transport only borrows them: it receives [`LocalTrack`] handles whose
//! enabled/live flags are shared with the controller, so muting here stops
//! transmission there without renegotiation.

use crate::negotiator::ConnectionNegotiator;
use crate::types::{CallMode, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// User or platform refused capture
    #[error("Capture permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found or busy
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// No media has been acquired
    #[error("Local media not acquired")]
    NotAcquired,

    /// Media already acquired for another session
    #[error("Local media already acquired")]
    AlreadyAcquired,

    /// Operation needs a video track
    #[error("No video track")]
    NoVideoTrack,

    /// Camera switch failed; the previous track is still in use
    #[error("Camera switch failed: {0}")]
    SwitchFailed(String),
}

/// Camera facing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraFacing {
    /// User-facing camera
    Front,
    /// Environment-facing camera
    Back,
}

impl CameraFacing {
    /// The other camera
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

/// Handle to a captured track
///
/// Clones share state, so a clone lent to the transport observes mute and
/// stop performed through the controller.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    facing: Option<CameraFacing>,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Wrap a freshly started capture
    pub fn new(id: impl Into<String>, kind: TrackKind, facing: Option<CameraFacing>) -> Self {
        Self {
            id: id.into(),
            kind,
            facing,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Track id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Media kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Camera facing, for video tracks
    pub fn facing(&self) -> Option<CameraFacing> {
        self.facing
    }

    /// Whether samples are transmitted
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable transmission without stopping capture
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether capture is running
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stop capture; idempotent
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            tracing::debug!(track_id = %self.id, "Track stopped");
        }
    }
}

/// Platform capture capability
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Start microphone capture
    async fn capture_audio(&self) -> Result<LocalTrack, MediaError>;

    /// Start camera capture with the given facing
    async fn capture_video(&self, facing: CameraFacing) -> Result<LocalTrack, MediaError>;
}

/// Outcome of a camera switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraSwitch {
    /// Now using this camera
    Switched(CameraFacing),
    /// Nothing to do: no video track, or video suspended
    Skipped,
}

/// Locally captured media of the current session
#[derive(Debug)]
pub struct LocalMediaState {
    /// Microphone track
    pub audio: LocalTrack,
    /// Camera track, for video calls
    pub video: Option<LocalTrack>,
    /// Audio transmission disabled
    pub muted: bool,
    /// Video transmission and preview disabled
    pub video_suspended: bool,
    /// Current camera
    pub facing: CameraFacing,
    /// Local preview shown
    pub preview_visible: bool,
}

/// Read-only view of local media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSnapshot {
    /// Audio track id
    pub audio_track: String,
    /// Video track id
    pub video_track: Option<String>,
    /// Whether the current video track is capturing
    pub video_live: bool,
    /// Muted flag
    pub muted: bool,
    /// Video suspended flag
    pub video_suspended: bool,
    /// Current camera
    pub facing: CameraFacing,
    /// Local preview shown
    pub preview_visible: bool,
}

/// Owner of local capture for at most one session
pub struct LocalMediaController {
    device: Arc<dyn CaptureDevice>,
    state: Option<LocalMediaState>,
}

impl LocalMediaController {
    /// Create a controller over a capture device
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            state: None,
        }
    }

    /// Whether media is currently held
    pub fn is_acquired(&self) -> bool {
        self.state.is_some()
    }

    /// Capture audio, and video for video calls
    ///
    /// Returns the tracks to lend to the transport. Nothing is left running
    /// when this fails.
    ///
    /// # Errors
    ///
    /// Returns error if either capture is denied or unavailable
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&mut self, mode: CallMode) -> Result<Vec<LocalTrack>, MediaError> {
        if self.state.is_some() {
            return Err(MediaError::AlreadyAcquired);
        }
        let audio = self.device.capture_audio().await?;
        let facing = CameraFacing::Front;
        let video = if mode.has_video() {
            match self.device.capture_video(facing).await {
                Ok(track) => Some(track),
                Err(e) => {
                    audio.stop();
                    tracing::warn!(error = %e, "Video capture failed, released audio");
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut tracks = vec![audio.clone()];
        tracks.extend(video.clone());
        tracing::info!(
            audio_track = %audio.id(),
            video_track = video.as_ref().map(LocalTrack::id),
            "Local media acquired"
        );
        self.state = Some(LocalMediaState {
            audio,
            preview_visible: video.is_some(),
            video,
            muted: false,
            video_suspended: false,
            facing,
        });
        Ok(tracks)
    }

    /// Flip the muted flag; returns the new value
    ///
    /// # Errors
    ///
    /// Returns error if no media is held
    pub fn toggle_mute(&mut self) -> Result<bool, MediaError> {
        let state = self.state.as_mut().ok_or(MediaError::NotAcquired)?;
        state.muted = !state.muted;
        state.audio.set_enabled(!state.muted);
        tracing::debug!(muted = state.muted, "Mute toggled");
        Ok(state.muted)
    }

    /// Flip the video-suspended flag; returns the new value
    ///
    /// # Errors
    ///
    /// Returns error if no media is held or there is no video track
    pub fn toggle_video(&mut self) -> Result<bool, MediaError> {
        let state = self.state.as_mut().ok_or(MediaError::NotAcquired)?;
        let video = state.video.as_ref().ok_or(MediaError::NoVideoTrack)?;
        state.video_suspended = !state.video_suspended;
        video.set_enabled(!state.video_suspended);
        state.preview_visible = !state.video_suspended;
        tracing::debug!(video_suspended = state.video_suspended, "Video toggled");
        Ok(state.video_suspended)
    }

    /// Swap to the opposite camera
    ///
    /// The new camera is captured before the old one is stopped, and the swap
    /// is only committed once the transport has accepted the new track. On
    /// any failure the previous track stays attached and live.
    ///
    /// # Errors
    ///
    /// Returns error if no media is held or the swap failed
    #[tracing::instrument(skip(self, negotiator))]
    pub async fn switch_camera(
        &mut self,
        negotiator: &dyn ConnectionNegotiator,
    ) -> Result<CameraSwitch, MediaError> {
        let state = self.state.as_mut().ok_or(MediaError::NotAcquired)?;
        let Some(current) = state.video.clone() else {
            return Ok(CameraSwitch::Skipped);
        };
        if state.video_suspended {
            return Ok(CameraSwitch::Skipped);
        }

        let target = state.facing.opposite();
        let replacement = self.device.capture_video(target).await.map_err(|e| {
            tracing::warn!(facing = ?target, error = %e, "Camera capture failed, keeping current track");
            MediaError::SwitchFailed(e.to_string())
        })?;

        if let Err(e) = negotiator.replace_track(TrackKind::Video, &replacement).await {
            replacement.stop();
            tracing::warn!(error = %e, "Track replacement failed, keeping current track");
            return Err(MediaError::SwitchFailed(e.to_string()));
        }

        current.stop();
        state.video = Some(replacement);
        state.facing = target;
        tracing::info!(facing = ?target, "Camera switched");
        Ok(CameraSwitch::Switched(target))
    }

    /// Stop every track; idempotent
    pub fn release(&mut self) -> bool {
        match self.state.take() {
            Some(state) => {
                state.audio.stop();
                if let Some(video) = &state.video {
                    video.stop();
                }
                tracing::info!("Local media released");
                true
            }
            None => false,
        }
    }

    /// Current state for display
    pub fn snapshot(&self) -> Option<MediaSnapshot> {
        self.state.as_ref().map(|state| MediaSnapshot {
            audio_track: state.audio.id().to_string(),
            video_track: state.video.as_ref().map(|v| v.id().to_string()),
            video_live: state.video.as_ref().is_some_and(LocalTrack::is_live),
            muted: state.muted,
            video_suspended: state.video_suspended,
            facing: state.facing,
            preview_visible: state.preview_visible,
        })
    }
}
