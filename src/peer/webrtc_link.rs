//! WebRTC negotiation backend
//!
//! Implements [`PeerLink`] over a real `RTCPeerConnection`. Outbound
//! tracks are bridged sample-by-sample from [`MediaTrack`] fan-outs into
//! `TrackLocalStaticSample` writers; inbound remote tracks are read off
//! their RTP pumps into [`MediaTrack`] handles and surfaced as one
//! stream per remote peer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::connection::{PeerLink, PeerLinkEvent, PeerLinkFactory};
use crate::config::RtcConfig;
use crate::error::{MeshError, Result};
use crate::media::{MediaSample, MediaStream, MediaTrack, TrackKind, TrackSource};

/// Negotiation payload carried opaquely through the signaling channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
    },
}

fn audio_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

fn video_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        rtcp_feedback: vec![],
    }
}

/// Creates [`WebRtcLink`]s from the configured ICE servers
pub struct WebRtcLinkFactory {
    rtc: RtcConfig,
}

impl WebRtcLinkFactory {
    pub fn new(rtc: RtcConfig) -> Arc<Self> {
        Arc::new(Self { rtc })
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = vec![];
        for stun_url in &self.rtc.stun_servers {
            servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &self.rtc.turn_servers {
            servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        servers
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::Sender<PeerLinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let link = WebRtcLink::new(remote_id, self.ice_servers(), events).await?;
        Ok(link as Arc<dyn PeerLink>)
    }
}

/// One outbound sender: the RTC track it writes and the pump feeding it
struct OutboundSender {
    source: MediaTrack,
    rtc_track: Arc<TrackLocalStaticSample>,
    pump: JoinHandle<()>,
}

/// A [`PeerLink`] over one `RTCPeerConnection`
pub struct WebRtcLink {
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::Sender<PeerLinkEvent>,
    senders: RwLock<HashMap<TrackKind, OutboundSender>>,
    /// Inbound stream, created on the first remote track
    inbound: Mutex<Option<MediaStream>>,
}

impl WebRtcLink {
    async fn new(
        remote_id: &str,
        ice_servers: Vec<RTCIceServer>,
        events: mpsc::Sender<PeerLinkEvent>,
    ) -> Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MeshError::negotiation(remote_id, format!("codec registration: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            MeshError::negotiation(remote_id, format!("interceptor registration: {e}"))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            MeshError::negotiation(remote_id, format!("peer connection creation: {e}"))
        })?);

        let link = Arc::new(Self {
            remote_id: remote_id.to_string(),
            pc,
            events,
            senders: RwLock::new(HashMap::new()),
            inbound: Mutex::new(None),
        });
        link.setup_event_handlers();
        Ok(link)
    }

    fn setup_event_handlers(self: &Arc<Self>) {
        // Trickle ICE: each gathered candidate goes out as its own signal
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(c) = candidate else { return };
                    let Ok(json) = c.to_json() else {
                        debug!("unserializable ice candidate dropped");
                        return;
                    };
                    let payload = SignalPayload::Candidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    };
                    if let Ok(value) = serde_json::to_value(&payload) {
                        let _ = events.send(PeerLinkEvent::Signal(value)).await;
                    }
                })
            }));

        let events = self.events.clone();
        let remote_id = self.remote_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let events = events.clone();
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    info!(peer = %remote_id, state = %s, "rtc connection state");
                    match s {
                        RTCPeerConnectionState::Failed => {
                            let _ = events
                                .send(PeerLinkEvent::Error("rtc connection failed".into()))
                                .await;
                        }
                        RTCPeerConnectionState::Closed => {
                            let _ = events.send(PeerLinkEvent::Closed).await;
                        }
                        _ => {}
                    }
                })
            }));

        let link = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |remote_track, _, _| {
            let link = link.clone();
            Box::pin(async move {
                if let Some(link) = link.upgrade() {
                    link.accept_remote_track(remote_track).await;
                }
            })
        }));
    }

    /// Wire an inbound remote track into the peer's stream and start
    /// pumping its RTP payloads.
    async fn accept_remote_track(self: &Arc<Self>, remote_track: Arc<TrackRemote>) {
        let kind = match remote_track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            RTPCodecType::Unspecified => {
                warn!(peer = %self.remote_id, "remote track of unspecified kind ignored");
                return;
            }
        };
        info!(peer = %self.remote_id, %kind, "remote track arrived");

        let track = MediaTrack::new(kind, TrackSource::Remote, None);

        let stream = {
            let mut inbound = self.inbound.lock().await;
            inbound.get_or_insert_with(MediaStream::new).clone()
        };
        stream.add_track(track.clone());

        let pump_track = track.clone();
        tokio::spawn(async move {
            loop {
                match remote_track.read_rtp().await {
                    Ok((packet, _)) => {
                        pump_track.push_sample(MediaSample::encoded(
                            packet.payload,
                            std::time::Duration::ZERO,
                        ));
                    }
                    Err(e) => {
                        debug!("remote track ended: {e}");
                        pump_track.stop();
                        break;
                    }
                }
            }
        });

        let _ = self.events.send(PeerLinkEvent::Stream(stream)).await;
    }

    /// Produce and publish a local offer
    async fn send_offer(&self) -> Result<()> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MeshError::negotiation(&self.remote_id, format!("create offer: {e}")))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| {
                MeshError::negotiation(&self.remote_id, format!("set local description: {e}"))
            })?;
        self.emit_signal(&SignalPayload::Offer { sdp: offer.sdp }).await
    }

    async fn emit_signal(&self, payload: &SignalPayload) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        let _ = self.events.send(PeerLinkEvent::Signal(value)).await;
        Ok(())
    }

    /// Spawn the bridge that forwards a [`MediaTrack`]'s samples into an
    /// RTC track writer. Ends when the source stops.
    fn spawn_sample_pump(
        source: &MediaTrack,
        rtc_track: Arc<TrackLocalStaticSample>,
    ) -> JoinHandle<()> {
        let mut samples = source.subscribe_samples();
        let mut ended = source.ended();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    recv = samples.recv() => match recv {
                        Ok(sample) => {
                            let rtc_sample = Sample {
                                data: sample.data,
                                duration: sample.duration,
                                ..Default::default()
                            };
                            if let Err(e) = rtc_track.write_sample(&rtc_sample).await {
                                debug!("sample write failed: {e}");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(dropped = n, "sample pump lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    res = ended.changed() => {
                        if res.is_err() || *ended.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn rtc_track_for(&self, track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        let capability = match track.kind() {
            TrackKind::Audio => audio_codec_capability(),
            TrackKind::Video => video_codec_capability(),
        };
        Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            format!("mesh-{}", self.remote_id),
        ))
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn start(&self) -> Result<()> {
        self.send_offer().await
    }

    async fn apply_signal(&self, payload: serde_json::Value) -> Result<()> {
        let payload: SignalPayload = serde_json::from_value(payload)?;
        match payload {
            SignalPayload::Offer { sdp } => {
                let offer = RTCSessionDescription::offer(sdp).map_err(|e| {
                    MeshError::negotiation(&self.remote_id, format!("invalid offer: {e}"))
                })?;
                self.pc.set_remote_description(offer).await.map_err(|e| {
                    MeshError::negotiation(&self.remote_id, format!("set remote offer: {e}"))
                })?;

                let answer = self.pc.create_answer(None).await.map_err(|e| {
                    MeshError::negotiation(&self.remote_id, format!("create answer: {e}"))
                })?;
                self.pc
                    .set_local_description(answer.clone())
                    .await
                    .map_err(|e| {
                        MeshError::negotiation(&self.remote_id, format!("set local answer: {e}"))
                    })?;
                self.emit_signal(&SignalPayload::Answer { sdp: answer.sdp })
                    .await
            }
            SignalPayload::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp).map_err(|e| {
                    MeshError::negotiation(&self.remote_id, format!("invalid answer: {e}"))
                })?;
                self.pc.set_remote_description(answer).await.map_err(|e| {
                    MeshError::negotiation(&self.remote_id, format!("set remote answer: {e}"))
                })
            }
            SignalPayload::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment: None,
                };
                if let Err(e) = self.pc.add_ice_candidate(init).await {
                    // Duplicate or late candidates after the connection
                    // succeeded are harmless
                    if self.pc.connection_state() == RTCPeerConnectionState::Connected {
                        debug!(peer = %self.remote_id, "late ice candidate dropped: {e}");
                        return Ok(());
                    }
                    return Err(MeshError::negotiation(
                        &self.remote_id,
                        format!("add ice candidate: {e}"),
                    ));
                }
                Ok(())
            }
        }
    }

    async fn add_outbound_track(&self, track: MediaTrack) -> Result<()> {
        let rtc_track = self.rtc_track_for(&track);
        self.pc
            .add_track(rtc_track.clone())
            .await
            .map_err(|e| MeshError::negotiation(&self.remote_id, format!("add track: {e}")))?;

        let pump = Self::spawn_sample_pump(&track, rtc_track.clone());
        let previous = self.senders.write().await.insert(
            track.kind(),
            OutboundSender {
                source: track.clone(),
                rtc_track,
                pump,
            },
        );
        if let Some(previous) = previous {
            previous.pump.abort();
        }
        debug!(peer = %self.remote_id, kind = %track.kind(), "outbound track attached");

        // Mid-call additions change the transceiver set and need a fresh
        // offer; the initial tracks ride the first negotiation
        if self.pc.remote_description().await.is_some() {
            self.send_offer().await?;
        }
        Ok(())
    }

    async fn replace_outbound_track(&self, kind: TrackKind, track: MediaTrack) -> Result<()> {
        let mut senders = self.senders.write().await;
        let Some(slot) = senders.get_mut(&kind) else {
            drop(senders);
            return self.add_outbound_track(track).await;
        };

        // The RTC track stays bound; only the sample source is repointed,
        // so no renegotiation happens
        slot.pump.abort();
        slot.pump = Self::spawn_sample_pump(&track, slot.rtc_track.clone());
        slot.source = track;
        debug!(peer = %self.remote_id, %kind, "outbound track repointed");
        Ok(())
    }

    async fn outbound_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.senders.read().await.get(&kind).map(|s| s.source.clone())
    }

    async fn close(&self) -> Result<()> {
        for (_, slot) in self.senders.write().await.drain() {
            slot.pump.abort();
        }
        self.pc
            .close()
            .await
            .map_err(|e| MeshError::negotiation(&self.remote_id, format!("close: {e}")))
    }
}
