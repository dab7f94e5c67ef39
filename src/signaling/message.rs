//! Signaling wire format
//!
//! The only wire format this core owns: addressed negotiation payloads
//! and presence notifications carried over the session-scoped channel.

use serde::{Deserialize, Serialize};

/// A message on the session's signaling channel
///
/// Negotiation payloads are opaque to the core; only the negotiation
/// backend interprets them. Presence messages carry no recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Addressed negotiation payload
    Signal {
        from: String,
        to: String,
        payload: serde_json::Value,
    },
    /// A peer announced itself on the channel
    PresenceJoin { from: String },
    /// A peer left the channel
    PresenceLeave { from: String },
}

impl SignalingMessage {
    pub fn signal(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::Signal {
            from: from.into(),
            to: to.into(),
            payload,
        }
    }

    pub fn join(from: impl Into<String>) -> Self {
        Self::PresenceJoin { from: from.into() }
    }

    pub fn leave(from: impl Into<String>) -> Self {
        Self::PresenceLeave { from: from.into() }
    }

    /// Sender id
    pub fn from(&self) -> &str {
        match self {
            Self::Signal { from, .. } => from,
            Self::PresenceJoin { from } => from,
            Self::PresenceLeave { from } => from,
        }
    }

    /// Recipient id; presence messages are unaddressed
    pub fn to(&self) -> Option<&str> {
        match self {
            Self::Signal { to, .. } => Some(to),
            _ => None,
        }
    }
}
