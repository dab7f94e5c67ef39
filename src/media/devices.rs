//! Media acquisition abstraction
//!
//! The platform capture layer (camera, microphone, display capture,
//! device enumeration, audio output routing) is an external collaborator
//! behind the [`MediaDevices`] trait. The call core only orchestrates
//! the tracks it hands back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::track::MediaTrack;
use crate::error::Result;

/// Device kind, matching the common enumeration categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaDeviceKind {
    #[serde(rename = "audioinput")]
    AudioInput,
    #[serde(rename = "audiooutput")]
    AudioOutput,
    #[serde(rename = "videoinput")]
    VideoInput,
}

impl std::fmt::Display for MediaDeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaDeviceKind::AudioInput => write!(f, "audioinput"),
            MediaDeviceKind::AudioOutput => write!(f, "audiooutput"),
            MediaDeviceKind::VideoInput => write!(f, "videoinput"),
        }
    }
}

/// A selectable capture or playback device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDeviceInfo {
    /// Stable device identifier
    pub id: String,
    pub kind: MediaDeviceKind,
    /// Human-readable label
    pub label: String,
}

/// Currently selected device per kind
///
/// Mutated only by explicit user action (`switch_device`), never
/// implicitly. `None` means the platform default device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(rename = "audioInputId")]
    pub audio_input_id: Option<String>,
    #[serde(rename = "audioOutputId")]
    pub audio_output_id: Option<String>,
    #[serde(rename = "videoInputId")]
    pub video_input_id: Option<String>,
}

/// Constraints for a microphone track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub device_id: Option<String>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Constraints for a camera track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub device_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

/// Combined acquisition request; `None` skips that kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Audio-and-video constraints honoring the current device settings
    pub fn audio_video(settings: &DeviceSettings, media: &crate::config::MediaConfig) -> Self {
        Self {
            audio: Some(AudioConstraints {
                device_id: settings.audio_input_id.clone(),
                echo_cancellation: media.echo_cancellation,
                noise_suppression: media.noise_suppression,
            }),
            video: Some(VideoConstraints {
                device_id: settings.video_input_id.clone(),
                width: media.video_width,
                height: media.video_height,
                frame_rate: media.video_frame_rate,
            }),
        }
    }

    pub fn audio_only(device_id: Option<String>) -> Self {
        Self {
            audio: Some(AudioConstraints {
                device_id,
                ..AudioConstraints::default()
            }),
            video: None,
        }
    }

    pub fn video_only(device_id: Option<String>) -> Self {
        Self {
            audio: None,
            video: Some(VideoConstraints {
                device_id,
                ..VideoConstraints::default()
            }),
        }
    }
}

/// Platform media acquisition API
///
/// Implementations map to the platform capture stack. Failure contract:
/// permission denial surfaces as `MeshError::DeviceAccess`, a constraint
/// naming a device id that no longer exists as `MeshError::DeviceNotFound`.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire camera and/or microphone tracks matching the constraints
    async fn acquire_user_media(&self, constraints: &MediaConstraints) -> Result<Vec<MediaTrack>>;

    /// Acquire a display-capture track set (video, optionally audio)
    async fn acquire_display_media(&self) -> Result<Vec<MediaTrack>>;

    /// Enumerate available devices
    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>>;

    /// Redirect audio playback to the given output device
    async fn select_audio_output(&self, device_id: &str) -> Result<()>;
}
