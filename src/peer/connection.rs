//! Per-peer connection state machine
//!
//! Wraps one bidirectional negotiation with a single remote participant.
//! The negotiation primitive itself (ICE/SDP exchange, media transport)
//! is an external collaborator behind [`PeerLink`]; this layer owns the
//! lifecycle: `idle -> negotiating -> connected -> closed`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::{MeshError, Result};
use crate::media::{MediaStream, MediaTrack, TrackKind};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Created but not yet negotiating (transient)
    Idle,
    Negotiating,
    Connected,
    Closed,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Idle => write!(f, "idle"),
            PeerState::Negotiating => write!(f, "negotiating"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// Events emitted by a negotiation backend
#[derive(Debug, Clone)]
pub enum PeerLinkEvent {
    /// Outbound negotiation data to deliver to the remote peer
    Signal(serde_json::Value),
    /// An inbound media stream arrived or changed
    Stream(MediaStream),
    /// The link failed; the connection must be destroyed
    Error(String),
    /// The link closed
    Closed,
}

/// ICE/SDP-style negotiation primitive
///
/// One link per remote peer. Events flow out through the channel handed
/// to the factory; inbound negotiation data is applied in arrival order
/// via `apply_signal` (per-peer order is a transport guarantee).
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Kick off negotiation as the initiating side (produces an offer)
    async fn start(&self) -> Result<()>;

    /// Apply inbound negotiation data from the remote peer.
    ///
    /// Duplicate or late candidates arriving after the connection
    /// succeeded must be tolerated, not treated as fatal.
    async fn apply_signal(&self, payload: serde_json::Value) -> Result<()>;

    /// Attach an outbound track
    async fn add_outbound_track(&self, track: MediaTrack) -> Result<()>;

    /// Repoint the outbound sender of a kind at a new track.
    ///
    /// A sender-level swap; must not trigger renegotiation.
    async fn replace_outbound_track(&self, kind: TrackKind, track: MediaTrack) -> Result<()>;

    /// Current outbound track of a kind, for introspection
    async fn outbound_track(&self, kind: TrackKind) -> Option<MediaTrack>;

    /// Close the link and release its resources
    async fn close(&self) -> Result<()>;
}

/// Creates negotiation links
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::Sender<PeerLinkEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}

/// A single peer's connection
pub struct PeerConnection {
    remote_id: String,
    initiator: bool,
    link: Arc<dyn PeerLink>,
    state_tx: watch::Sender<PeerState>,
    state_rx: watch::Receiver<PeerState>,
}

impl PeerConnection {
    /// Create the link, attach the current local tracks, and enter
    /// `negotiating`. The initiating side produces its offer immediately;
    /// the answering side waits for the inbound offer.
    pub(crate) async fn open(
        factory: &Arc<dyn PeerLinkFactory>,
        remote_id: &str,
        initiator: bool,
        local_tracks: Vec<MediaTrack>,
        events: mpsc::Sender<PeerLinkEvent>,
    ) -> Result<Self> {
        let link = factory.create(remote_id, events).await?;

        for track in local_tracks {
            link.add_outbound_track(track).await?;
        }
        if initiator {
            link.start().await?;
        }

        let (state_tx, state_rx) = watch::channel(PeerState::Negotiating);
        info!(peer = remote_id, initiator, "peer connection negotiating");

        Ok(Self {
            remote_id: remote_id.to_string(),
            initiator,
            link,
            state_tx,
            state_rx,
        })
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> PeerState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<PeerState> {
        self.state_rx.clone()
    }

    /// Apply an inbound signal. Signals for a closed connection are
    /// dropped; a backend failure surfaces as a negotiation error.
    pub async fn handle_signal(&self, payload: serde_json::Value) -> Result<()> {
        if self.state() == PeerState::Closed {
            debug!(peer = %self.remote_id, "signal for closed connection dropped");
            return Ok(());
        }
        self.link
            .apply_signal(payload)
            .await
            .map_err(|e| MeshError::negotiation(&self.remote_id, e.to_string()))
    }

    /// Mark the first inbound stream arrival
    pub(crate) fn mark_connected(&self) {
        if self.state() != PeerState::Closed {
            let _ = self.state_tx.send(PeerState::Connected);
            info!(peer = %self.remote_id, "peer connected");
        }
    }

    pub async fn add_outbound_track(&self, track: MediaTrack) -> Result<()> {
        self.link.add_outbound_track(track).await
    }

    pub async fn replace_outbound_track(&self, kind: TrackKind, track: MediaTrack) -> Result<()> {
        self.link.replace_outbound_track(kind, track).await
    }

    pub async fn outbound_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.link.outbound_track(kind).await
    }

    /// Close the connection and release the link. Idempotent.
    pub async fn close(&self) {
        if *self.state_rx.borrow() == PeerState::Closed {
            return;
        }
        let _ = self.state_tx.send(PeerState::Closed);
        if let Err(e) = self.link.close().await {
            debug!(peer = %self.remote_id, "link close reported: {e}");
        }
        info!(peer = %self.remote_id, "peer connection closed");
    }
}
