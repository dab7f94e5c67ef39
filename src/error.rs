use thiserror::Error;

/// Crate-wide error type
///
/// Variants mirror the failure domains of the call core: device access,
/// per-peer negotiation, the signaling transport, and screen capture.
/// Component-local failures (one device call, one peer) are contained at
/// the component boundary and never tear down unrelated peers or the
/// whole session.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Device access denied: {0}")]
    DeviceAccess(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Negotiation failed [peer {peer}]: {reason}")]
    Negotiation { peer: String, reason: String },

    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Screen share error: {0}")]
    ScreenShare(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MeshError {
    /// Negotiation error for a specific peer
    pub fn negotiation(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Negotiation {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is recoverable from the session's point of view
    ///
    /// Recoverable errors are surfaced as dismissible notices; the session
    /// continues with a reduced participant/media set.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, MeshError>;
