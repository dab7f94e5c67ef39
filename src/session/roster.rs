//! Participant roster
//!
//! Snapshot-style view of the remote participants in a session. The
//! session controller is the only writer; embedding code reads
//! point-in-time snapshots and reacts to bus events for changes.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::media::{MediaStream, TrackKind};
use crate::peer::PeerState;

/// One remote participant as currently known
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    /// Resolved by the embedding from its own user directory; transport
    /// identities are opaque
    pub display_name: Option<String>,
    /// Inbound media; `None` until the connection produces a stream
    pub stream: Option<MediaStream>,
    pub is_speaking: bool,
    pub connection_state: PeerState,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    /// Whether the participant's audio is currently silent or absent
    pub fn is_muted(&self) -> bool {
        self.stream
            .as_ref()
            .and_then(|s| s.first_track(TrackKind::Audio))
            .map(|t| !t.is_enabled())
            .unwrap_or(true)
    }

    /// Whether the participant's video is currently disabled or absent
    pub fn is_video_off(&self) -> bool {
        self.stream
            .as_ref()
            .and_then(|s| s.first_track(TrackKind::Video))
            .map(|t| !t.is_enabled())
            .unwrap_or(true)
    }
}

/// The set of remote participants
#[derive(Default)]
pub struct Roster {
    entries: RwLock<HashMap<String, Participant>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant in `negotiating`. Re-inserting an existing id
    /// keeps the original entry.
    pub fn insert(&self, id: &str) {
        self.entries
            .write()
            .entry(id.to_string())
            .or_insert_with(|| Participant {
                id: id.to_string(),
                display_name: None,
                stream: None,
                is_speaking: false,
                connection_state: PeerState::Negotiating,
                joined_at: Utc::now(),
            });
    }

    /// Record the first inbound stream and the connected state
    pub fn set_connected(&self, id: &str, stream: MediaStream) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.stream = Some(stream);
            entry.connection_state = PeerState::Connected;
        }
    }

    /// Attach a resolved display name
    pub fn set_display_name(&self, id: &str, display_name: impl Into<String>) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.display_name = Some(display_name.into());
        }
    }

    /// Replace a connected participant's stream
    pub fn set_stream(&self, id: &str, stream: MediaStream) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.stream = Some(stream);
        }
    }

    /// Update speaking state. Unknown ids (the local participant, a peer
    /// already removed) are a no-op.
    pub fn set_speaking(&self, id: &str, speaking: bool) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.is_speaking = speaking;
        }
    }

    pub fn remove(&self, id: &str) -> Option<Participant> {
        self.entries.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Participant> {
        self.entries.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Point-in-time snapshot ordered by join time
    pub fn snapshot(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> =
            self.entries.read().values().cloned().collect();
        participants.sort_by_key(|p| p.joined_at);
        participants
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
