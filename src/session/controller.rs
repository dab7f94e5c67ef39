//! Session orchestration
//!
//! The controller is the embedding-facing surface: it wires local media,
//! signaling, the peer mesh, and activity detection into one session and
//! translates their internal reports into bus events and roster updates.
//! At most one session is active per controller.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audio::{ActivityEvent, AudioActivityDetector};
use crate::config::SessionConfig;
use crate::error::{MeshError, Result};
use crate::events::{EventBus, NoticeSeverity, SessionEvent};
use crate::media::{
    LocalMediaManager, MediaDeviceInfo, MediaDeviceKind, MediaDevices, MediaEvent, MediaStream,
    TrackKind,
};
use crate::peer::{PeerConnectionManager, PeerEvent, PeerLinkFactory};
use crate::session::roster::{Participant, Roster};
use crate::signaling::{SignalingClient, SignalingTransport, TransportEvent};

/// Event pipe capacity between subsystems and the controller pumps
const PIPE_CAPACITY: usize = 64;

/// Everything owned by one joined session
struct ActiveSession {
    session_id: String,
    media: Arc<LocalMediaManager>,
    signaling: Arc<SignalingClient>,
    peers: Arc<PeerConnectionManager>,
    detector: Arc<AudioActivityDetector>,
    pumps: Vec<JoinHandle<()>>,
}

/// Orchestrates one multi-party call session
pub struct SessionController {
    config: SessionConfig,
    devices: Arc<dyn MediaDevices>,
    transport: Arc<dyn SignalingTransport>,
    link_factory: Arc<dyn PeerLinkFactory>,
    bus: Arc<EventBus>,
    self_id: String,
    roster: Arc<Roster>,
    active: AsyncMutex<Option<ActiveSession>>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        devices: Arc<dyn MediaDevices>,
        transport: Arc<dyn SignalingTransport>,
        link_factory: Arc<dyn PeerLinkFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            devices,
            transport,
            link_factory,
            bus: Arc::new(EventBus::new()),
            self_id: uuid::Uuid::new_v4().to_string(),
            roster: Arc::new(Roster::new()),
            active: AsyncMutex::new(None),
        })
    }

    /// The local participant's id, announced to the session
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// The local participant's display name
    pub fn display_name(&self) -> &str {
        &self.config.display_name
    }

    /// Subscribe to session events
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    /// Snapshot of the remote participants, ordered by join time
    pub fn participants(&self) -> Vec<Participant> {
        self.roster.snapshot()
    }

    pub async fn in_session(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Join a session: acquire local media, connect signaling, announce
    /// presence, and start reacting to the channel.
    ///
    /// Media acquisition failure aborts the join before anything touches
    /// the network. A signaling failure after acquisition releases the
    /// media again; a failed join leaves the controller fully idle.
    pub async fn join(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(MeshError::Session("already in a session".into()));
        }

        let (media_tx, media_rx) = mpsc::channel(PIPE_CAPACITY);
        let media = LocalMediaManager::new(self.devices.clone(), self.config.media.clone(), media_tx);
        media.acquire_default().await?;

        let signaling = Arc::new(SignalingClient::new(self.transport.clone(), &self.self_id));
        let (transport_tx, transport_rx) = mpsc::channel(PIPE_CAPACITY);
        if let Err(e) = signaling.connect(session_id, transport_tx).await {
            media.release().await;
            return Err(e);
        }

        let (peer_tx, peer_rx) = mpsc::channel(PIPE_CAPACITY);
        let peers = PeerConnectionManager::new(
            &self.self_id,
            self.link_factory.clone(),
            signaling.clone(),
            media.stream(),
            peer_tx,
            self.config.negotiation_timeout(),
        );

        let (activity_tx, activity_rx) = mpsc::channel(PIPE_CAPACITY);
        let detector = AudioActivityDetector::new(&self.config.speaking, activity_tx);
        // The local stream is watched under the local id, so the local
        // speaking indicator rides the same event as remote ones
        detector.watch(&self.self_id, media.stream());

        let pumps = vec![
            self.spawn_transport_pump(transport_rx, peers.clone()),
            self.spawn_peer_pump(peer_rx, detector.clone()),
            self.spawn_activity_pump(activity_rx),
            self.spawn_media_pump(media_rx, media.clone(), peers.clone()),
        ];

        if let Err(e) = signaling.announce_presence().await {
            for pump in &pumps {
                pump.abort();
            }
            peers.destroy_all().await;
            detector.clear();
            signaling.disconnect().await;
            media.release().await;
            return Err(e);
        }

        info!(session_id, self_id = %self.self_id, "session joined");
        self.publish_media_state(&media);

        *active = Some(ActiveSession {
            session_id: session_id.to_string(),
            media,
            signaling,
            peers,
            detector,
            pumps,
        });
        Ok(())
    }

    /// Leave the current session, releasing everything. Idempotent.
    pub async fn leave(&self) {
        let Some(session) = self.active.lock().await.take() else {
            return;
        };

        // Media first so capture devices free immediately, then the mesh,
        // then the channel so remote peers observe the leave
        session.media.release().await;
        session.peers.destroy_all().await;
        session.signaling.disconnect().await;
        session.detector.clear();
        for pump in &session.pumps {
            pump.abort();
        }
        self.roster.clear();

        info!(session_id = %session.session_id, "session left");
    }

    /// Flip microphone mute. Returns the new muted state.
    ///
    /// A toggle flips the track's enabled flag in place: no track stops,
    /// no signaling traffic, no renegotiation on any connection.
    pub async fn toggle_mic(&self) -> Result<bool> {
        let media = self.current_media().await?;
        let enabled = media.toggle_track(TrackKind::Audio)?;
        self.publish_media_state(&media);
        Ok(!enabled)
    }

    /// Flip outgoing video. Returns the new video-off state.
    pub async fn toggle_camera(&self) -> Result<bool> {
        let media = self.current_media().await?;
        let enabled = media.toggle_track(TrackKind::Video)?;
        self.publish_media_state(&media);
        Ok(!enabled)
    }

    /// Start or stop screen sharing, depending on the current state.
    /// Returns whether sharing is active afterwards.
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        let media = self.current_media().await?;
        if media.is_screen_sharing() {
            media.stop_screen_share().await?;
            Ok(false)
        } else {
            media.start_screen_share().await?;
            Ok(true)
        }
    }

    /// Switch the selected capture or output device
    pub async fn switch_device(&self, device_id: &str, kind: MediaDeviceKind) -> Result<()> {
        let media = self.current_media().await?;
        media.switch_device(device_id, kind).await
    }

    /// Enumerate the available media devices
    pub async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
        self.devices.enumerate_devices().await
    }

    /// The local stream (self-view), while a session is active
    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.active.lock().await.as_ref().map(|s| s.media.stream())
    }

    pub async fn is_muted(&self) -> bool {
        match self.active.lock().await.as_ref() {
            Some(s) => s.media.is_muted(),
            None => true,
        }
    }

    pub async fn is_screen_sharing(&self) -> bool {
        match self.active.lock().await.as_ref() {
            Some(s) => s.media.is_screen_sharing(),
            None => false,
        }
    }

    async fn current_media(&self) -> Result<Arc<LocalMediaManager>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|s| s.media.clone())
            .ok_or_else(|| MeshError::Session("not in a session".into()))
    }

    fn publish_media_state(&self, media: &LocalMediaManager) {
        self.bus.publish(SessionEvent::LocalMediaChanged {
            muted: media.is_muted(),
            video_off: media.is_video_off(),
            screen_sharing: media.is_screen_sharing(),
        });
    }

    /// Routes channel traffic into the mesh manager
    fn spawn_transport_pump(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<TransportEvent>,
        peers: Arc<PeerConnectionManager>,
    ) -> JoinHandle<()> {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    TransportEvent::PresenceJoin { peer_id } => {
                        if let Err(e) = peers.handle_presence_join(&peer_id).await {
                            warn!(peer = %peer_id, "failed to connect to joining peer: {e}");
                            bus.publish(SessionEvent::Notice {
                                severity: NoticeSeverity::Warning,
                                message: format!("could not connect to {peer_id}: {e}"),
                            });
                        }
                    }
                    TransportEvent::PresenceLeave { peer_id } => {
                        peers.handle_presence_leave(&peer_id).await;
                    }
                    TransportEvent::Message(message) => {
                        if let Err(e) = peers.handle_message(message).await {
                            warn!("signaling message handling failed: {e}");
                            bus.publish(SessionEvent::Notice {
                                severity: NoticeSeverity::Warning,
                                message: format!("peer connection failed: {e}"),
                            });
                        }
                    }
                    TransportEvent::Dropped { reason } => {
                        // Established connections keep running peer to peer;
                        // only new joins are lost until rejoin
                        warn!(reason, "signaling channel dropped");
                        bus.publish(SessionEvent::TransportDown { reason });
                        break;
                    }
                }
            }
        })
    }

    /// Translates mesh reports into roster updates and bus events
    fn spawn_peer_pump(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<PeerEvent>,
        detector: Arc<AudioActivityDetector>,
    ) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let roster = self.roster.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    PeerEvent::Negotiating { peer_id } => {
                        roster.insert(&peer_id);
                        bus.publish(SessionEvent::ParticipantJoined { id: peer_id });
                    }
                    PeerEvent::Connected { peer_id, stream } => {
                        roster.set_connected(&peer_id, stream.clone());
                        detector.watch(&peer_id, stream);
                        bus.publish(SessionEvent::ParticipantConnected { id: peer_id });
                    }
                    PeerEvent::StreamUpdated { peer_id, stream } => {
                        roster.set_stream(&peer_id, stream.clone());
                        detector.watch(&peer_id, stream);
                    }
                    PeerEvent::Closed { peer_id, reason } => {
                        detector.unwatch(&peer_id);
                        roster.remove(&peer_id);
                        if let Some(reason) = &reason {
                            bus.publish(SessionEvent::Notice {
                                severity: NoticeSeverity::Warning,
                                message: format!("connection to {peer_id} lost: {reason}"),
                            });
                        }
                        bus.publish(SessionEvent::ParticipantLeft {
                            id: peer_id,
                            reason,
                        });
                    }
                }
            }
        })
    }

    /// Mirrors speaking transitions into the roster and onto the bus
    fn spawn_activity_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<ActivityEvent>) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let roster = self.roster.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // The local id is not in the roster; this is a no-op for it
                roster.set_speaking(&event.key, event.speaking);
                bus.publish(SessionEvent::SpeakingChanged {
                    id: event.key,
                    speaking: event.speaking,
                });
            }
        })
    }

    /// Mirrors local track changes into every peer connection
    fn spawn_media_pump(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<MediaEvent>,
        media: Arc<LocalMediaManager>,
        peers: Arc<PeerConnectionManager>,
    ) -> JoinHandle<()> {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    MediaEvent::TrackReplaced { kind, track } => {
                        peers.replace_outbound_track(kind, track).await;
                    }
                    MediaEvent::TrackAdded { track } => {
                        peers.add_outbound_track(track).await;
                    }
                    MediaEvent::ScreenShareStarted | MediaEvent::ScreenShareStopped => {}
                }
                bus.publish(SessionEvent::LocalMediaChanged {
                    muted: media.is_muted(),
                    video_off: media.is_video_off(),
                    screen_sharing: media.is_screen_sharing(),
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use crate::testkit::{wait_until, FakeMediaDevices, LoopbackHub, RecordingLinkFactory};
    use std::time::Duration;
    use tokio_test::assert_ok;

    struct TestPeer {
        controller: Arc<SessionController>,
        factory: Arc<RecordingLinkFactory>,
    }

    fn peer(hub: &LoopbackHub, key: &str) -> TestPeer {
        let factory = RecordingLinkFactory::new();
        let controller = SessionController::new(
            SessionConfig::default(),
            Arc::new(FakeMediaDevices::new()),
            hub.client(key),
            factory.clone() as Arc<dyn PeerLinkFactory>,
        );
        TestPeer {
            controller,
            factory,
        }
    }

    fn connected_count(c: &Arc<SessionController>) -> usize {
        c.participants()
            .iter()
            .filter(|p| p.connection_state == crate::peer::PeerState::Connected)
            .count()
    }

    #[tokio::test]
    async fn test_three_party_join_and_leave() {
        let hub = LoopbackHub::new();
        let a = peer(&hub, "a");
        let b = peer(&hub, "b");
        let c = peer(&hub, "c");
        let mut a_events = a.controller.events();

        tokio_test::assert_ok!(a.controller.join("room").await);
        tokio_test::assert_ok!(b.controller.join("room").await);
        tokio_test::assert_ok!(c.controller.join("room").await);

        // Full mesh: everyone connects to everyone else
        wait_until(|| connected_count(&a.controller) == 2).await;
        wait_until(|| connected_count(&b.controller) == 2).await;
        wait_until(|| connected_count(&c.controller) == 2).await;

        // A watches itself plus one stream per connected peer
        let a_detector = {
            let active = a.controller.active.lock().await;
            active.as_ref().unwrap().detector.clone()
        };
        assert_eq!(a_detector.watched_count(), 3);

        let b_id = b.controller.self_id().to_string();
        b.controller.leave().await;
        wait_until(|| a.controller.participants().len() == 1).await;
        wait_until(|| c.controller.participants().len() == 1).await;
        assert!(b.controller.participants().is_empty());

        // B's detector entry is gone along with its roster entry
        wait_until(|| a_detector.watched_count() == 2).await;

        // Let the bus publish catch up with the roster change
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut saw_b_join = false;
        let mut saw_b_leave = false;
        while let Ok(event) = a_events.try_recv() {
            match event {
                SessionEvent::ParticipantJoined { id } if id == b_id => saw_b_join = true,
                SessionEvent::ParticipantLeft { id, reason } if id == b_id => {
                    assert!(reason.is_none());
                    saw_b_leave = true;
                }
                _ => {}
            }
        }
        assert!(saw_b_join && saw_b_leave);
    }

    #[tokio::test]
    async fn test_join_twice_fails() {
        let hub = LoopbackHub::new();
        let a = peer(&hub, "a");
        a.controller.join("room").await.unwrap();
        assert!(a.controller.join("room").await.is_err());
        assert!(a.controller.in_session().await);
    }

    #[tokio::test]
    async fn test_controls_require_session() {
        let hub = LoopbackHub::new();
        let a = peer(&hub, "a");
        assert!(a.controller.toggle_mic().await.is_err());
        assert!(a.controller.toggle_screen_share().await.is_err());
        // Leave before join is a no-op
        a.controller.leave().await;
    }

    #[tokio::test]
    async fn test_media_failure_aborts_join() {
        let hub = LoopbackHub::new();
        let factory = RecordingLinkFactory::new();
        let devices = Arc::new(FakeMediaDevices::denying());
        let controller = SessionController::new(
            SessionConfig::default(),
            devices,
            hub.client("a"),
            factory as Arc<dyn PeerLinkFactory>,
        );

        assert!(matches!(
            controller.join("room").await.unwrap_err(),
            MeshError::DeviceAccess(_)
        ));
        assert!(!controller.in_session().await);
    }

    #[tokio::test]
    async fn test_mute_produces_no_signaling_traffic() {
        let hub = LoopbackHub::new();
        let a = peer(&hub, "a");
        let b = peer(&hub, "b");
        a.controller.join("room").await.unwrap();
        b.controller.join("room").await.unwrap();
        wait_until(|| connected_count(&a.controller) == 1).await;

        let b_id = b.controller.self_id().to_string();
        let link = a.factory.link(&b_id).unwrap();
        let applied_before = link.applied_signals().len();
        let emitted_before = link.emitted_signals();

        assert!(a.controller.toggle_mic().await.unwrap());
        assert!(a.controller.is_muted().await);
        assert!(!a.controller.toggle_mic().await.unwrap());

        // Give any stray traffic a chance to surface
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.applied_signals().len(), applied_before);
        assert_eq!(link.emitted_signals(), emitted_before);

        // The outbound track handle never changed
        let outbound = link.outbound(TrackKind::Audio).unwrap();
        let local = a.controller.local_stream().await.unwrap();
        assert!(outbound.same_track(&local.first_track(TrackKind::Audio).unwrap()));
    }

    #[tokio::test]
    async fn test_device_switch_repoints_all_senders() {
        let hub = LoopbackHub::new();
        let a = peer(&hub, "a");
        let b = peer(&hub, "b");
        let c = peer(&hub, "c");
        a.controller.join("room").await.unwrap();
        b.controller.join("room").await.unwrap();
        c.controller.join("room").await.unwrap();
        wait_until(|| connected_count(&a.controller) == 2).await;

        a.controller
            .switch_device("mic-usb", MediaDeviceKind::AudioInput)
            .await
            .unwrap();

        for id in [b.controller.self_id(), c.controller.self_id()] {
            let factory = a.factory.clone();
            let id = id.to_string();
            wait_until(move || {
                factory
                    .link(&id)
                    .and_then(|l| l.outbound(TrackKind::Audio))
                    .map(|t| t.device_id() == Some("mic-usb"))
                    .unwrap_or(false)
            })
            .await;
        }
    }

    #[tokio::test]
    async fn test_screen_share_repoints_video_and_restores_on_source_end() {
        let hub = LoopbackHub::new();
        let a = peer(&hub, "a");
        let b = peer(&hub, "b");
        a.controller.join("room").await.unwrap();
        b.controller.join("room").await.unwrap();
        wait_until(|| connected_count(&a.controller) == 1).await;
        let b_id = b.controller.self_id().to_string();

        assert!(a.controller.toggle_screen_share().await.unwrap());
        let factory = a.factory.clone();
        let id = b_id.clone();
        wait_until(move || {
            factory
                .link(&id)
                .and_then(|l| l.outbound(TrackKind::Video))
                .map(|t| t.source() == TrackSource::Display)
                .unwrap_or(false)
        })
        .await;

        // Capture source ends the share (system UI); capture restores
        let local = a.controller.local_stream().await.unwrap();
        local.first_track(TrackKind::Video).unwrap().stop();

        let factory = a.factory.clone();
        wait_until(move || {
            factory
                .link(&b_id)
                .and_then(|l| l.outbound(TrackKind::Video))
                .map(|t| t.source() == TrackSource::Camera)
                .unwrap_or(false)
        })
        .await;
        assert!(!a.controller.is_screen_sharing().await);
    }

    #[tokio::test]
    async fn test_peer_failure_is_isolated() {
        let hub = LoopbackHub::new();
        let a = peer(&hub, "a");
        let b = peer(&hub, "b");
        let c = peer(&hub, "c");
        let mut a_events = a.controller.events();
        a.controller.join("room").await.unwrap();
        b.controller.join("room").await.unwrap();
        c.controller.join("room").await.unwrap();
        wait_until(|| connected_count(&a.controller) == 2).await;

        let b_id = b.controller.self_id().to_string();
        a.factory.link(&b_id).unwrap().fail("transport torn").await;

        wait_until(|| a.controller.participants().len() == 1).await;
        assert_eq!(
            a.controller.participants()[0].id,
            c.controller.self_id()
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut saw_left = false;
        while let Ok(event) = a_events.try_recv() {
            if let SessionEvent::ParticipantLeft { id, reason } = event {
                if id == b_id {
                    assert!(reason.unwrap().contains("transport torn"));
                    saw_left = true;
                }
            }
        }
        assert!(saw_left);
    }

    #[tokio::test]
    async fn test_transport_drop_keeps_existing_peers() {
        let hub = LoopbackHub::new();
        let a = peer(&hub, "a");
        let b = peer(&hub, "b");
        let mut a_events = a.controller.events();
        a.controller.join("room").await.unwrap();
        b.controller.join("room").await.unwrap();
        wait_until(|| connected_count(&a.controller) == 1).await;

        hub.fail_channel("session:room", "backend restart").await;

        loop {
            match a_events.recv().await.unwrap() {
                SessionEvent::TransportDown { reason } => {
                    assert_eq!(reason, "backend restart");
                    break;
                }
                _ => continue,
            }
        }
        // The established connection is unaffected
        assert_eq!(connected_count(&a.controller), 1);
    }

    #[tokio::test]
    async fn test_local_speaking_events() {
        let hub = LoopbackHub::new();
        let a = peer(&hub, "a");
        let mut events = a.controller.events();
        a.controller.join("room").await.unwrap();

        let local = a.controller.local_stream().await.unwrap();
        local
            .first_track(TrackKind::Audio)
            .unwrap()
            .set_energy(120.0);

        loop {
            match events.recv().await.unwrap() {
                SessionEvent::SpeakingChanged { id, speaking } => {
                    assert_eq!(id, a.controller.self_id());
                    assert!(speaking);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_leave_releases_everything() {
        let hub = LoopbackHub::new();
        let a = peer(&hub, "a");
        let b = peer(&hub, "b");
        a.controller.join("room").await.unwrap();
        b.controller.join("room").await.unwrap();
        wait_until(|| connected_count(&a.controller) == 1).await;

        let local = a.controller.local_stream().await.unwrap();
        a.controller.leave().await;
        assert!(!a.controller.in_session().await);
        assert!(!local.is_live());
        assert!(a.controller.participants().is_empty());

        // Idempotent
        a.controller.leave().await;
    }
}
