//! In-process fakes for the external collaborators: a loopback
//! signaling hub, a scripted media device layer, and a recording
//! negotiation backend that completes handshakes without a network.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{MeshError, Result};
use crate::media::{
    MediaConstraints, MediaDeviceInfo, MediaDeviceKind, MediaDevices, MediaStream, MediaTrack,
    TrackKind, TrackSource,
};
use crate::peer::{PeerLink, PeerLinkEvent, PeerLinkFactory};
use crate::signaling::{SignalingMessage, SignalingTransport, TransportEvent};

/// Poll a condition until it holds, panicking after two seconds
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within two seconds");
}

/// Async variant of [`wait_until`]
pub async fn wait_until_async<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within two seconds");
}

struct HubSubscriber {
    key: String,
    announced: Option<String>,
    sender: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct HubInner {
    /// channel name -> subscribers
    channels: Mutex<HashMap<String, Vec<HubSubscriber>>>,
}

/// In-process publish/subscribe hub standing in for the signaling server
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport handle for one client, identified by `key`
    pub fn client(&self, key: &str) -> Arc<dyn SignalingTransport> {
        Arc::new(LoopbackClient {
            key: key.to_string(),
            inner: self.inner.clone(),
        })
    }

    /// Simulate the channel dropping for every subscriber
    pub async fn fail_channel(&self, channel: &str, reason: &str) {
        let senders: Vec<mpsc::Sender<TransportEvent>> = {
            let mut channels = self.inner.channels.lock();
            channels
                .remove(channel)
                .map(|subs| subs.into_iter().map(|s| s.sender).collect())
                .unwrap_or_default()
        };
        for sender in senders {
            let _ = sender
                .send(TransportEvent::Dropped {
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

struct LoopbackClient {
    key: String,
    inner: Arc<HubInner>,
}

impl LoopbackClient {
    /// Senders for everyone else on the channel
    fn other_senders(&self, channel: &str) -> Vec<mpsc::Sender<TransportEvent>> {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.key != self.key)
                    .map(|s| s.sender.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SignalingTransport for LoopbackClient {
    async fn subscribe(&self, channel: &str, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        self.inner
            .channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(HubSubscriber {
                key: self.key.clone(),
                announced: None,
                sender: events,
            });
        Ok(())
    }

    async fn announce(&self, channel: &str, self_id: &str) -> Result<()> {
        {
            let mut channels = self.inner.channels.lock();
            let subs = channels
                .get_mut(channel)
                .ok_or_else(|| MeshError::Transport("not subscribed".into()))?;
            let own = subs
                .iter_mut()
                .find(|s| s.key == self.key)
                .ok_or_else(|| MeshError::Transport("not subscribed".into()))?;
            own.announced = Some(self_id.to_string());
        }
        for sender in self.other_senders(channel) {
            let _ = sender
                .send(TransportEvent::PresenceJoin {
                    peer_id: self_id.to_string(),
                })
                .await;
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &SignalingMessage) -> Result<()> {
        for sender in self.other_senders(channel) {
            let _ = sender.send(TransportEvent::Message(message.clone())).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let announced = {
            let mut channels = self.inner.channels.lock();
            let Some(subs) = channels.get_mut(channel) else {
                return Ok(());
            };
            let Some(pos) = subs.iter().position(|s| s.key == self.key) else {
                return Ok(());
            };
            subs.remove(pos).announced
        };
        if let Some(peer_id) = announced {
            for sender in self.other_senders(channel) {
                let _ = sender
                    .send(TransportEvent::PresenceLeave {
                        peer_id: peer_id.clone(),
                    })
                    .await;
            }
        }
        Ok(())
    }
}

/// Scripted device layer
pub struct FakeMediaDevices {
    deny_user_media: AtomicBool,
    deny_display_media: AtomicBool,
    with_display_audio: AtomicBool,
    with_display_video: AtomicBool,
    display_tracks: Mutex<Vec<MediaTrack>>,
    selected_output: Mutex<Option<String>>,
}

impl FakeMediaDevices {
    pub fn new() -> Self {
        Self {
            deny_user_media: AtomicBool::new(false),
            deny_display_media: AtomicBool::new(false),
            with_display_audio: AtomicBool::new(false),
            with_display_video: AtomicBool::new(true),
            display_tracks: Mutex::new(vec![]),
            selected_output: Mutex::new(None),
        }
    }

    /// A device layer where every capture request is permission-denied
    pub fn denying() -> Self {
        let devices = Self::new();
        devices.deny_user_media.store(true, Ordering::Release);
        devices.deny_display_media.store(true, Ordering::Release);
        devices
    }

    pub fn set_display_audio(&self, enabled: bool) {
        self.with_display_audio.store(enabled, Ordering::Release);
    }

    pub fn set_display_video(&self, enabled: bool) {
        self.with_display_video.store(enabled, Ordering::Release);
    }

    /// Every track handed out by `acquire_display_media`, in order
    pub fn display_tracks(&self) -> Vec<MediaTrack> {
        self.display_tracks.lock().clone()
    }

    pub fn selected_output(&self) -> Option<String> {
        self.selected_output.lock().clone()
    }
}

impl Default for FakeMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire_user_media(&self, constraints: &MediaConstraints) -> Result<Vec<MediaTrack>> {
        if self.deny_user_media.load(Ordering::Acquire) {
            return Err(MeshError::DeviceAccess("permission denied".into()));
        }
        let mut tracks = vec![];
        if let Some(audio) = &constraints.audio {
            let device_id = audio.device_id.clone().unwrap_or_else(|| "mic-default".into());
            tracks.push(MediaTrack::new(
                TrackKind::Audio,
                TrackSource::Microphone,
                Some(device_id),
            ));
        }
        if let Some(video) = &constraints.video {
            let device_id = video.device_id.clone().unwrap_or_else(|| "cam-default".into());
            tracks.push(MediaTrack::new(
                TrackKind::Video,
                TrackSource::Camera,
                Some(device_id),
            ));
        }
        Ok(tracks)
    }

    async fn acquire_display_media(&self) -> Result<Vec<MediaTrack>> {
        if self.deny_display_media.load(Ordering::Acquire) {
            return Err(MeshError::DeviceAccess("permission denied".into()));
        }
        let mut tracks = vec![];
        if self.with_display_video.load(Ordering::Acquire) {
            tracks.push(MediaTrack::new(TrackKind::Video, TrackSource::Display, None));
        }
        if self.with_display_audio.load(Ordering::Acquire) {
            tracks.push(MediaTrack::new(TrackKind::Audio, TrackSource::Display, None));
        }
        self.display_tracks.lock().extend(tracks.iter().cloned());
        Ok(tracks)
    }

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(vec![
            MediaDeviceInfo {
                id: "mic-default".into(),
                kind: MediaDeviceKind::AudioInput,
                label: "Built-in Microphone".into(),
            },
            MediaDeviceInfo {
                id: "mic-usb".into(),
                kind: MediaDeviceKind::AudioInput,
                label: "USB Microphone".into(),
            },
            MediaDeviceInfo {
                id: "cam-default".into(),
                kind: MediaDeviceKind::VideoInput,
                label: "Built-in Camera".into(),
            },
            MediaDeviceInfo {
                id: "spk-default".into(),
                kind: MediaDeviceKind::AudioOutput,
                label: "Built-in Speakers".into(),
            },
        ])
    }

    async fn select_audio_output(&self, device_id: &str) -> Result<()> {
        *self.selected_output.lock() = Some(device_id.to_string());
        Ok(())
    }
}

/// Negotiation backend that records traffic and completes handshakes
/// instantly: an applied offer produces an answer and an inbound stream,
/// an applied answer produces an inbound stream.
pub struct RecordingLink {
    remote_id: String,
    events: mpsc::Sender<PeerLinkEvent>,
    applied: Mutex<Vec<serde_json::Value>>,
    outbound_tracks: Mutex<HashMap<TrackKind, MediaTrack>>,
    emitted: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingLink {
    /// Signals applied from the remote side, in order
    pub fn applied_signals(&self) -> Vec<serde_json::Value> {
        self.applied.lock().clone()
    }

    /// Number of signals this link has emitted
    pub fn emitted_signals(&self) -> usize {
        self.emitted.load(Ordering::Acquire)
    }

    pub fn outbound(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.outbound_tracks.lock().get(&kind).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver an inbound stream, as a connected transport would
    pub async fn deliver_stream(&self, stream: MediaStream) {
        let _ = self.events.send(PeerLinkEvent::Stream(stream)).await;
    }

    /// Simulate a fatal link failure
    pub async fn fail(&self, reason: &str) {
        tracing::debug!(peer = %self.remote_id, reason, "link failure injected");
        let _ = self
            .events
            .send(PeerLinkEvent::Error(reason.to_string()))
            .await;
    }

    async fn emit_signal(&self, payload: serde_json::Value) {
        self.emitted.fetch_add(1, Ordering::AcqRel);
        let _ = self.events.send(PeerLinkEvent::Signal(payload)).await;
    }

    fn remote_stream(&self) -> MediaStream {
        let stream = MediaStream::new();
        stream.add_track(MediaTrack::new(TrackKind::Audio, TrackSource::Remote, None));
        stream
    }
}

#[async_trait]
impl PeerLink for RecordingLink {
    async fn start(&self) -> Result<()> {
        self.emit_signal(serde_json::json!({"kind": "offer"})).await;
        Ok(())
    }

    async fn apply_signal(&self, payload: serde_json::Value) -> Result<()> {
        self.applied.lock().push(payload.clone());
        match payload["kind"].as_str() {
            Some("offer") => {
                self.emit_signal(serde_json::json!({"kind": "answer"})).await;
                self.deliver_stream(self.remote_stream()).await;
            }
            Some("answer") => {
                self.deliver_stream(self.remote_stream()).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn add_outbound_track(&self, track: MediaTrack) -> Result<()> {
        self.outbound_tracks.lock().insert(track.kind(), track);
        Ok(())
    }

    async fn replace_outbound_track(&self, kind: TrackKind, track: MediaTrack) -> Result<()> {
        self.outbound_tracks.lock().insert(kind, track);
        Ok(())
    }

    async fn outbound_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.outbound(kind)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Factory keeping every created [`RecordingLink`] reachable by peer id
pub struct RecordingLinkFactory {
    links: Mutex<HashMap<String, Arc<RecordingLink>>>,
}

impl RecordingLinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(HashMap::new()),
        })
    }

    pub fn link(&self, remote_id: &str) -> Option<Arc<RecordingLink>> {
        self.links.lock().get(remote_id).cloned()
    }
}

#[async_trait]
impl PeerLinkFactory for RecordingLinkFactory {
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::Sender<PeerLinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let link = Arc::new(RecordingLink {
            remote_id: remote_id.to_string(),
            events,
            applied: Mutex::new(vec![]),
            outbound_tracks: Mutex::new(HashMap::new()),
            emitted: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.links.lock().insert(remote_id.to_string(), link.clone());
        Ok(link as Arc<dyn PeerLink>)
    }
}
