//! Mesh connection management
//!
//! Owns the arena of remote peer id -> connection. All arena mutation
//! funnels through this manager: presence events create and destroy
//! connections, inbound signals route to the owning connection, and
//! outbound negotiation data is republished through the signaling
//! client. The roster lives upstairs in the session controller; this
//! layer only reports.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{PeerConnection, PeerLinkEvent, PeerLinkFactory, PeerState};
use crate::error::Result;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::signaling::{SignalingClient, SignalingMessage};

/// Per-link event channel capacity
const LINK_EVENT_CAPACITY: usize = 32;

/// Reports from the connection layer to the session controller
///
/// The controller owns the roster; these events are its only input from
/// the mesh. `Closed` is emitted exactly once per connection, after the
/// arena entry is gone and the link released, so the roster removal the
/// controller performs on it completes the atomic teardown.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A connection entered negotiation (arena entry exists)
    Negotiating { peer_id: String },
    /// First inbound media stream arrived
    Connected { peer_id: String, stream: MediaStream },
    /// The inbound stream changed after connection
    StreamUpdated { peer_id: String, stream: MediaStream },
    /// Connection torn down; `reason` is set for error-driven teardown
    Closed {
        peer_id: String,
        reason: Option<String>,
    },
}

/// Owner of the peer connection mesh
pub struct PeerConnectionManager {
    self_id: String,
    factory: Arc<dyn PeerLinkFactory>,
    signaling: Arc<SignalingClient>,
    /// Local stream handle; new connections snapshot its live tracks
    local_stream: MediaStream,
    peers: RwLock<HashMap<String, Arc<PeerConnection>>>,
    pumps: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
    events: mpsc::Sender<PeerEvent>,
    negotiation_timeout: Option<Duration>,
}

impl PeerConnectionManager {
    pub fn new(
        self_id: impl Into<String>,
        factory: Arc<dyn PeerLinkFactory>,
        signaling: Arc<SignalingClient>,
        local_stream: MediaStream,
        events: mpsc::Sender<PeerEvent>,
        negotiation_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id: self_id.into(),
            factory,
            signaling,
            local_stream,
            peers: RwLock::new(HashMap::new()),
            pumps: parking_lot::Mutex::new(HashMap::new()),
            events,
            negotiation_timeout,
        })
    }

    /// A peer announced itself; the observing side initiates.
    pub async fn handle_presence_join(self: &Arc<Self>, peer_id: &str) -> Result<()> {
        self.create_peer(peer_id, true).await
    }

    /// A peer left the channel; tear its connection down.
    pub async fn handle_presence_leave(&self, peer_id: &str) {
        self.destroy_peer(peer_id, None).await;
    }

    /// Route an inbound signaling message.
    ///
    /// A signal addressed to us from an unknown peer creates a
    /// non-initiator connection on demand: the remote side initiated
    /// before we observed its join. Signals for known peers are applied
    /// to the existing connection, never a duplicate.
    pub async fn handle_message(self: &Arc<Self>, message: SignalingMessage) -> Result<()> {
        match message {
            SignalingMessage::Signal { from, to, payload } => {
                if from == self.self_id || to != self.self_id {
                    return Ok(());
                }
                if !self.peers.read().await.contains_key(&from) {
                    debug!(peer = %from, "inbound signal for unknown peer, answering");
                    self.create_peer(&from, false).await?;
                }
                let conn = self.peers.read().await.get(&from).cloned();
                if let Some(conn) = conn {
                    if let Err(e) = conn.handle_signal(payload).await {
                        warn!(peer = %from, "inbound signal failed: {e}");
                        self.destroy_peer(&from, Some(e.to_string())).await;
                    }
                }
                Ok(())
            }
            SignalingMessage::PresenceJoin { from } => self.handle_presence_join(&from).await,
            SignalingMessage::PresenceLeave { from } => {
                self.handle_presence_leave(&from).await;
                Ok(())
            }
        }
    }

    /// Create a connection for a remote peer.
    ///
    /// Exactly one connection exists per remote id; a second create for
    /// the same id is a no-op. The arena lock is held across link
    /// creation so concurrent creates cannot race a duplicate in.
    pub async fn create_peer(self: &Arc<Self>, remote_id: &str, initiator: bool) -> Result<()> {
        if remote_id == self.self_id {
            return Ok(());
        }

        let mut peers = self.peers.write().await;
        if peers.contains_key(remote_id) {
            debug!(peer = remote_id, "connection already exists, ignoring create");
            return Ok(());
        }

        let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let local_tracks: Vec<MediaTrack> = self
            .local_stream
            .tracks()
            .into_iter()
            .filter(|t| t.is_live())
            .collect();

        let conn = Arc::new(
            PeerConnection::open(&self.factory, remote_id, initiator, local_tracks, link_tx)
                .await?,
        );
        peers.insert(remote_id.to_string(), conn.clone());
        drop(peers);

        let pump = self.spawn_link_pump(remote_id.to_string(), conn, link_rx);
        self.pumps.lock().insert(remote_id.to_string(), pump);

        let _ = self
            .events
            .send(PeerEvent::Negotiating {
                peer_id: remote_id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Tear down one connection: arena entry removed, link released,
    /// one `Closed` report emitted. No-op for unknown ids.
    ///
    /// Sibling connections are never touched; reconnection happens only
    /// through a fresh presence-join.
    pub async fn destroy_peer(&self, remote_id: &str, reason: Option<String>) {
        let conn = self.peers.write().await.remove(remote_id);
        let Some(conn) = conn else {
            return;
        };
        conn.close().await;
        // Detach the pump; it exits on the closed state it just observed
        self.pumps.lock().remove(remote_id);

        info!(peer = remote_id, ?reason, "peer destroyed");
        let _ = self
            .events
            .send(PeerEvent::Closed {
                peer_id: remote_id.to_string(),
                reason,
            })
            .await;
    }

    /// Repoint every live connection's outbound sender of a kind.
    ///
    /// A failure on one connection is logged and contained; the
    /// remaining connections are still updated.
    pub async fn replace_outbound_track(&self, kind: TrackKind, track: MediaTrack) {
        let peers: Vec<Arc<PeerConnection>> = self.peers.read().await.values().cloned().collect();
        for conn in peers {
            if let Err(e) = conn.replace_outbound_track(kind, track.clone()).await {
                warn!(peer = conn.remote_id(), %kind, "outbound track replace failed: {e}");
            }
        }
    }

    /// Attach an additional outbound track to every live connection
    pub async fn add_outbound_track(&self, track: MediaTrack) {
        let peers: Vec<Arc<PeerConnection>> = self.peers.read().await.values().cloned().collect();
        for conn in peers {
            if let Err(e) = conn.add_outbound_track(track.clone()).await {
                warn!(peer = conn.remote_id(), "outbound track add failed: {e}");
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn connection(&self, remote_id: &str) -> Option<Arc<PeerConnection>> {
        self.peers.read().await.get(remote_id).cloned()
    }

    /// Close every connection without per-peer reports (session teardown)
    pub async fn destroy_all(&self) {
        let drained: Vec<(String, Arc<PeerConnection>)> =
            self.peers.write().await.drain().collect();
        for (_, conn) in &drained {
            conn.close().await;
        }
        self.pumps.lock().clear();
        if !drained.is_empty() {
            info!(count = drained.len(), "all peer connections destroyed");
        }
    }

    fn spawn_link_pump(
        self: &Arc<Self>,
        remote_id: String,
        conn: Arc<PeerConnection>,
        mut link_rx: mpsc::Receiver<PeerLinkEvent>,
    ) -> JoinHandle<()> {
        let manager: Weak<PeerConnectionManager> = Arc::downgrade(self);
        let signaling = self.signaling.clone();
        let events = self.events.clone();
        let self_id = self.self_id.clone();
        let deadline = self
            .negotiation_timeout
            .map(|t| tokio::time::Instant::now() + t);

        tokio::spawn(async move {
            let mut state_rx = conn.state_watch();
            // Far-future stand-in keeps the select arm well-formed when
            // no timeout is configured
            let sleep_target = deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400));
            loop {
                tokio::select! {
                    maybe = link_rx.recv() => match maybe {
                        Some(PeerLinkEvent::Signal(payload)) => {
                            signaling
                                .send(SignalingMessage::signal(&self_id, &remote_id, payload))
                                .await;
                        }
                        Some(PeerLinkEvent::Stream(stream)) => {
                            if conn.state() == PeerState::Connected {
                                let _ = events
                                    .send(PeerEvent::StreamUpdated {
                                        peer_id: remote_id.clone(),
                                        stream,
                                    })
                                    .await;
                            } else {
                                conn.mark_connected();
                                let _ = events
                                    .send(PeerEvent::Connected {
                                        peer_id: remote_id.clone(),
                                        stream,
                                    })
                                    .await;
                            }
                        }
                        Some(PeerLinkEvent::Error(reason)) => {
                            warn!(peer = %remote_id, "link error: {reason}");
                            if let Some(m) = manager.upgrade() {
                                m.destroy_peer(&remote_id, Some(reason)).await;
                            }
                            break;
                        }
                        Some(PeerLinkEvent::Closed) => {
                            if let Some(m) = manager.upgrade() {
                                m.destroy_peer(&remote_id, None).await;
                            }
                            break;
                        }
                        None => break,
                    },
                    res = state_rx.changed() => {
                        if res.is_err() || *state_rx.borrow() == PeerState::Closed {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(sleep_target),
                        if deadline.is_some() && conn.state() == PeerState::Negotiating =>
                    {
                        info!(peer = %remote_id, "negotiation timed out");
                        if let Some(m) = manager.upgrade() {
                            m.destroy_peer(&remote_id, Some("negotiation timed out".into()))
                                .await;
                        }
                        break;
                    }
                }
            }
        })
    }
}
