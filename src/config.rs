//! Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Display name announced for the local participant
    pub display_name: String,
    /// Default media acquisition settings
    pub media: MediaConfig,
    /// Audio activity (speaking) detection settings
    pub speaking: SpeakingConfig,
    /// Negotiation timeout in milliseconds
    ///
    /// `None` (the default) leaves an unanswered offer in `negotiating`
    /// indefinitely. When set, a connection stuck past the deadline is
    /// closed exactly like a link error; a fresh presence-join from the
    /// transport re-creates it.
    pub negotiation_timeout_ms: Option<u64>,
    /// ICE server configuration for the WebRTC negotiation backend
    pub rtc: RtcConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            media: MediaConfig::default(),
            speaking: SpeakingConfig::default(),
            negotiation_timeout_ms: None,
            rtc: RtcConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_ms.map(Duration::from_millis)
    }
}

/// Default media acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Capture width
    pub video_width: u32,
    /// Capture height
    pub video_height: u32,
    /// Capture frame rate
    pub video_frame_rate: u32,
    /// Request echo cancellation on the microphone track
    pub echo_cancellation: bool,
    /// Request noise suppression on the microphone track
    pub noise_suppression: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_width: 1280,
            video_height: 720,
            video_frame_rate: 30,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Audio activity detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakingConfig {
    /// Mean energy threshold above which a stream counts as speaking (0-255 scale)
    pub threshold: f32,
    /// Polling cadence in milliseconds
    pub poll_interval_ms: u64,
    /// Hold time in milliseconds before speaking drops back to false
    ///
    /// Smooths flicker around the threshold. Zero disables the hold; the
    /// raw threshold comparison is the baseline behavior.
    pub hold_ms: u64,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            threshold: 30.0,
            poll_interval_ms: 33,
            hold_ms: 0,
        }
    }
}

impl SpeakingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

/// ICE server configuration for the WebRTC negotiation backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs, multiple URLs allow UDP/TCP fallback
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}
