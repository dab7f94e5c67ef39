//! Session event bus
//!
//! Broadcasts user-visible session events (roster changes, speaking
//! state, media control changes, transient error notices) to embedding
//! code. Events are fire-and-forget notifications.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notice severity for transient, dismissible notices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeSeverity {
    Info,
    Warning,
    Error,
}

/// Session event enumeration
///
/// Tagged for serialization as `{"event": "...", "data": {...}}` so
/// embedding transports can forward events verbatim.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// A remote peer entered negotiation and was added to the roster
    #[serde(rename = "participant.joined")]
    ParticipantJoined {
        /// Peer id
        id: String,
    },

    /// A participant's first media stream arrived; it is now connected
    #[serde(rename = "participant.connected")]
    ParticipantConnected {
        /// Peer id
        id: String,
    },

    /// A participant's connection was torn down and the roster entry removed
    #[serde(rename = "participant.left")]
    ParticipantLeft {
        /// Peer id
        id: String,
        /// Failure reason when the teardown was caused by an error
        reason: Option<String>,
    },

    /// Speaking state of a stream changed
    #[serde(rename = "participant.speaking")]
    SpeakingChanged {
        /// Peer id, or the local participant's own id
        id: String,
        speaking: bool,
    },

    /// Local media controls changed (mute, camera, screen share)
    #[serde(rename = "media.changed")]
    LocalMediaChanged {
        muted: bool,
        video_off: bool,
        screen_sharing: bool,
    },

    /// The signaling channel dropped
    ///
    /// Existing peer connections keep running; no new peers can join
    /// until the user leaves and rejoins.
    #[serde(rename = "transport.down")]
    TransportDown { reason: String },

    /// Transient, dismissible notice
    #[serde(rename = "session.notice")]
    Notice {
        severity: NoticeSeverity,
        message: String,
    },
}

impl SessionEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ParticipantJoined { .. } => "participant.joined",
            Self::ParticipantConnected { .. } => "participant.connected",
            Self::ParticipantLeft { .. } => "participant.left",
            Self::SpeakingChanged { .. } => "participant.speaking",
            Self::LocalMediaChanged { .. } => "media.changed",
            Self::TransportDown { .. } => "transport.down",
            Self::Notice { .. } => "session.notice",
        }
    }
}

/// Broadcast bus for session events
///
/// If there are no active subscribers, published events are silently
/// dropped. Slow subscribers that fall behind the ring buffer receive a
/// `Lagged` error and miss events.
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: SessionEvent) {
        tracing::trace!(event = event.event_name(), "session event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::ParticipantJoined {
            id: "peer-a".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::ParticipantJoined { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        // Must not panic without subscribers
        bus.publish(SessionEvent::TransportDown {
            reason: "test".to_string(),
        });
    }

    #[test]
    fn test_serialization() {
        let event = SessionEvent::SpeakingChanged {
            id: "peer-a".to_string(),
            speaking: true,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("participant.speaking"));

        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, SessionEvent::SpeakingChanged { speaking: true, .. }));
    }

    #[test]
    fn test_event_name() {
        let event = SessionEvent::LocalMediaChanged {
            muted: true,
            video_off: false,
            screen_sharing: false,
        };
        assert_eq!(event.event_name(), "media.changed");
    }
}
