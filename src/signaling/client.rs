//! Signaling client
//!
//! Thin wrapper over the external publish/subscribe transport, scoped to
//! one session channel. Each session controller owns exactly one client;
//! the channel subscription is a resource acquired on `connect` and
//! released on `disconnect`, never a free-standing global.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::message::SignalingMessage;
use crate::error::{MeshError, Result};

/// Events delivered by the transport to a subscriber
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A client joined the channel (presence tracking)
    PresenceJoin { peer_id: String },
    /// A client left the channel
    PresenceLeave { peer_id: String },
    /// A broadcast signaling message
    Message(SignalingMessage),
    /// The channel connection dropped; no further events will arrive
    Dropped { reason: String },
}

/// External publish/subscribe transport with presence tracking
///
/// Delivery contract: per-sender message order is preserved, no ordering
/// across senders, no delivery acknowledgment. `subscribe` resolves only
/// once the subscription is confirmed, so a caller that announces after
/// `subscribe` returns cannot miss its own rapid leave/join.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Subscribe to a channel; resolves after the subscription is confirmed
    async fn subscribe(
        &self,
        channel: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()>;

    /// Announce presence on a subscribed channel
    async fn announce(&self, channel: &str, self_id: &str) -> Result<()>;

    /// Broadcast a message to the channel (best-effort)
    async fn publish(&self, channel: &str, message: &SignalingMessage) -> Result<()>;

    /// Leave the channel
    async fn unsubscribe(&self, channel: &str) -> Result<()>;
}

/// Per-session signaling client
pub struct SignalingClient {
    transport: Arc<dyn SignalingTransport>,
    self_id: String,
    channel: Mutex<Option<String>>,
    connected: AtomicBool,
}

impl SignalingClient {
    pub fn new(transport: Arc<dyn SignalingTransport>, self_id: impl Into<String>) -> Self {
        Self {
            transport,
            self_id: self_id.into(),
            channel: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Subscribe to the session's channel.
    ///
    /// Returns once the subscription is confirmed; the caller must call
    /// `announce_presence` afterwards, not before.
    pub async fn connect(
        &self,
        session_id: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        if self.is_connected() {
            return Err(MeshError::Session("signaling already connected".into()));
        }
        let channel = channel_name(session_id);
        self.transport.subscribe(&channel, events).await?;
        *self.channel.lock() = Some(channel.clone());
        self.connected.store(true, Ordering::Release);
        info!(channel, self_id = %self.self_id, "signaling connected");
        Ok(())
    }

    /// Announce the local client on the channel.
    ///
    /// Errors if called before `connect` has confirmed the subscription.
    pub async fn announce_presence(&self) -> Result<()> {
        let channel = self.current_channel()?;
        self.transport.announce(&channel, &self.self_id).await?;
        debug!(channel, "presence announced");
        Ok(())
    }

    /// Broadcast a message, best-effort.
    ///
    /// Delivery failure is silent by design; a permanently unreachable
    /// peer surfaces as a negotiation timeout in the connection state
    /// machine, not here.
    pub async fn send(&self, message: SignalingMessage) {
        let Ok(channel) = self.current_channel() else {
            debug!("send on disconnected signaling client dropped");
            return;
        };
        if let Err(e) = self.transport.publish(&channel, &message).await {
            debug!("signaling publish failed (best-effort): {e}");
        }
    }

    /// Unsubscribe from the channel. Idempotent.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            if let Err(e) = self.transport.unsubscribe(&channel).await {
                warn!("signaling unsubscribe failed: {e}");
            }
            info!(channel, "signaling disconnected");
        }
    }

    fn current_channel(&self) -> Result<String> {
        if !self.is_connected() {
            return Err(MeshError::Transport("signaling not connected".into()));
        }
        self.channel
            .lock()
            .clone()
            .ok_or_else(|| MeshError::Transport("signaling not connected".into()))
    }
}

/// Channel name scoped by session id
fn channel_name(session_id: &str) -> String {
    format!("session:{session_id}")
}
