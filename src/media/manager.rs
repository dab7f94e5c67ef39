//! Local media management
//!
//! Owns the local stream exclusively. Every track mutation (toggle,
//! replace, device switch, screen share) funnels through this manager;
//! replacements are reported on the media event pipe so the session
//! layer mirrors them into every live peer connection.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::devices::{DeviceSettings, MediaConstraints, MediaDeviceKind, MediaDevices};
use super::track::{MediaStream, MediaTrack, TrackKind, TrackSource};
use crate::config::MediaConfig;
use crate::error::{MeshError, Result};

/// Reports emitted by the local media manager
///
/// A `TrackReplaced` that is not mirrored into every live peer
/// connection is a protocol violation: the remote side keeps a sender
/// pointed at a stopped track and sees frozen media.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// The current track of this kind changed; repoint every outbound sender
    TrackReplaced { kind: TrackKind, track: MediaTrack },
    /// An additional track joined the local stream (display-capture audio)
    TrackAdded { track: MediaTrack },
    ScreenShareStarted,
    ScreenShareStopped,
}

struct ScreenShare {
    /// Waits for the capture source to end the share from outside
    watcher: JoinHandle<()>,
    /// Display-capture audio track added alongside the microphone, if any
    display_audio_id: Option<String>,
}

/// Owner of the local camera/microphone/display tracks
pub struct LocalMediaManager {
    devices: Arc<dyn MediaDevices>,
    media_config: MediaConfig,
    stream: MediaStream,
    settings: Mutex<DeviceSettings>,
    screen: AsyncMutex<Option<ScreenShare>>,
    sharing: AtomicBool,
    events: mpsc::Sender<MediaEvent>,
}

impl LocalMediaManager {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        media_config: MediaConfig,
        events: mpsc::Sender<MediaEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            devices,
            media_config,
            stream: MediaStream::new(),
            settings: Mutex::new(DeviceSettings::default()),
            screen: AsyncMutex::new(None),
            sharing: AtomicBool::new(false),
            events,
        })
    }

    /// The local stream; identity is stable across track replacement
    pub fn stream(&self) -> MediaStream {
        self.stream.clone()
    }

    pub fn settings(&self) -> DeviceSettings {
        self.settings.lock().clone()
    }

    /// Acquire camera/microphone tracks and add them to the local stream
    pub async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        let tracks = self.devices.acquire_user_media(constraints).await?;
        info!(tracks = tracks.len(), "local media acquired");
        for track in tracks {
            self.stream.add_track(track);
        }
        Ok(self.stream.clone())
    }

    /// Acquire per current device settings and default quality
    pub async fn acquire_default(&self) -> Result<MediaStream> {
        let constraints = MediaConstraints::audio_video(&self.settings(), &self.media_config);
        self.acquire(&constraints).await
    }

    /// Flip `enabled` on the current capture track of the given kind.
    ///
    /// Returns the new enabled state. The track keeps running and no
    /// renegotiation happens anywhere.
    pub fn toggle_track(&self, kind: TrackKind) -> Result<bool> {
        let track = self
            .capture_track(kind)
            .ok_or_else(|| MeshError::Media(format!("no live {kind} track to toggle")))?;
        let enabled = track.toggle();
        debug!(%kind, enabled, "track toggled");
        Ok(enabled)
    }

    /// Replace the current track of a kind with a new one.
    ///
    /// Stops and removes the old track, adds the new one, reports the
    /// replacement on the event pipe, and returns the new track.
    pub async fn replace_track(&self, kind: TrackKind, new_track: MediaTrack) -> Result<MediaTrack> {
        if let Some(old) = self.live_track(kind) {
            old.stop();
            self.stream.remove_track(old.id());
            debug!(%kind, old = old.id(), new = new_track.id(), "track replaced");
        }
        self.stream.add_track(new_track.clone());
        self.emit(MediaEvent::TrackReplaced {
            kind,
            track: new_track.clone(),
        })
        .await;
        Ok(new_track)
    }

    /// Start display capture, swapping the outgoing video track for it.
    ///
    /// Display-capture audio, when present, is added alongside the
    /// microphone track rather than replacing it. When the capture source
    /// ends the share (system UI), `stop_screen_share` runs automatically.
    pub async fn start_screen_share(self: &Arc<Self>) -> Result<MediaStream> {
        let mut screen = self.screen.lock().await;
        if screen.is_some() {
            return Err(MeshError::ScreenShare("screen share already active".into()));
        }

        let tracks = self
            .devices
            .acquire_display_media()
            .await
            .map_err(|e| MeshError::ScreenShare(e.to_string()))?;

        let Some(display_video) = tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .cloned()
        else {
            // Audio-only captures must not leak live tracks
            for track in &tracks {
                track.stop();
            }
            return Err(MeshError::ScreenShare(
                "display capture produced no video track".into(),
            ));
        };
        let display_audio = tracks.iter().find(|t| t.kind() == TrackKind::Audio).cloned();

        self.replace_track(TrackKind::Video, display_video.clone())
            .await?;

        let display_audio_id = if let Some(audio) = &display_audio {
            self.stream.add_track(audio.clone());
            self.emit(MediaEvent::TrackAdded {
                track: audio.clone(),
            })
            .await;
            Some(audio.id().to_string())
        } else {
            None
        };

        let watcher = spawn_share_watcher(Arc::downgrade(self), display_video.clone());
        *screen = Some(ScreenShare {
            watcher,
            display_audio_id,
        });
        self.sharing.store(true, Ordering::Release);
        drop(screen);

        info!("screen share started");
        self.emit(MediaEvent::ScreenShareStarted).await;

        let mut shared = vec![display_video];
        shared.extend(display_audio);
        Ok(MediaStream::with_tracks(shared))
    }

    /// Stop the screen share and restore camera/microphone capture.
    ///
    /// Re-acquires both kinds per the current device settings and routes
    /// each through `replace_track`. Idempotent.
    pub async fn stop_screen_share(&self) -> Result<()> {
        let state = {
            let mut screen = self.screen.lock().await;
            self.sharing.store(false, Ordering::Release);
            screen.take()
        };
        let Some(state) = state else {
            return Ok(());
        };
        state.watcher.abort();

        if let Some(audio_id) = state.display_audio_id {
            if let Some(track) = self.stream.remove_track(&audio_id) {
                track.stop();
            }
        }

        let constraints = MediaConstraints::audio_video(&self.settings(), &self.media_config);
        let tracks = self
            .devices
            .acquire_user_media(&constraints)
            .await
            .map_err(|e| MeshError::ScreenShare(format!("failed to restore capture: {e}")))?;
        for track in tracks {
            self.replace_track(track.kind(), track).await?;
        }

        info!("screen share stopped, capture restored");
        self.emit(MediaEvent::ScreenShareStopped).await;
        Ok(())
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.sharing.load(Ordering::Acquire)
    }

    /// Switch the selected device for a kind.
    ///
    /// Validates the device id against the current enumeration, records
    /// it in the device settings, and for input kinds acquires a
    /// replacement track routed through `replace_track`.
    pub async fn switch_device(&self, device_id: &str, kind: MediaDeviceKind) -> Result<()> {
        let known = self.devices.enumerate_devices().await?;
        if !known.iter().any(|d| d.id == device_id && d.kind == kind) {
            return Err(MeshError::DeviceNotFound(format!("{kind} {device_id}")));
        }

        match kind {
            MediaDeviceKind::AudioOutput => {
                self.devices.select_audio_output(device_id).await?;
                self.settings.lock().audio_output_id = Some(device_id.to_string());
                info!(device_id, "audio output switched");
                Ok(())
            }
            MediaDeviceKind::AudioInput => {
                self.settings.lock().audio_input_id = Some(device_id.to_string());
                let constraints = MediaConstraints::audio_only(Some(device_id.to_string()));
                let track = self.acquire_single(&constraints, TrackKind::Audio).await?;
                self.replace_track(TrackKind::Audio, track).await?;
                info!(device_id, "audio input switched");
                Ok(())
            }
            MediaDeviceKind::VideoInput => {
                self.settings.lock().video_input_id = Some(device_id.to_string());
                let constraints = MediaConstraints::video_only(Some(device_id.to_string()));
                let track = self.acquire_single(&constraints, TrackKind::Video).await?;
                self.replace_track(TrackKind::Video, track).await?;
                info!(device_id, "video input switched");
                Ok(())
            }
        }
    }

    /// Stop every local track. Idempotent.
    pub async fn release(&self) {
        if let Some(state) = self.screen.lock().await.take() {
            state.watcher.abort();
        }
        self.sharing.store(false, Ordering::Release);
        self.stream.stop_all();
        debug!("local media released");
    }

    /// Whether the microphone is currently muted
    pub fn is_muted(&self) -> bool {
        self.capture_track(TrackKind::Audio)
            .map(|t| !t.is_enabled())
            .unwrap_or(true)
    }

    /// Whether outgoing video is currently disabled
    pub fn is_video_off(&self) -> bool {
        self.live_track(TrackKind::Video)
            .map(|t| !t.is_enabled())
            .unwrap_or(true)
    }

    async fn acquire_single(
        &self,
        constraints: &MediaConstraints,
        kind: TrackKind,
    ) -> Result<MediaTrack> {
        let tracks = self.devices.acquire_user_media(constraints).await?;
        tracks
            .into_iter()
            .find(|t| t.kind() == kind)
            .ok_or_else(|| MeshError::Media(format!("acquisition produced no {kind} track")))
    }

    /// Current capture track of a kind, preferring camera/microphone over
    /// display-capture tracks
    fn capture_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        let tracks = self.stream.tracks_of(kind);
        tracks
            .iter()
            .find(|t| t.source() != TrackSource::Display)
            .or_else(|| tracks.first())
            .cloned()
    }

    /// First live track of a kind, preferring non-display sources
    fn live_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.capture_track(kind)
    }

    async fn emit(&self, event: MediaEvent) {
        if self.events.send(event).await.is_err() {
            debug!("media event pipe closed, report dropped");
        }
    }
}

/// Watch a display-capture track for the capture-source-initiated end
/// and trigger the stop flow.
///
/// The stop runs in a freshly spawned task so the watcher handle can be
/// aborted safely from inside `stop_screen_share`.
fn spawn_share_watcher(manager: Weak<LocalMediaManager>, track: MediaTrack) -> JoinHandle<()> {
    let mut ended = track.ended();
    tokio::spawn(async move {
        // Subscribing marks the current value as seen; the track may
        // already have ended before this task started
        if !*ended.borrow() {
            loop {
                if ended.changed().await.is_err() {
                    return;
                }
                if *ended.borrow() {
                    break;
                }
            }
        }
        let Some(manager) = manager.upgrade() else {
            return;
        };
        debug!("display capture ended by source, stopping screen share");
        tokio::spawn(async move {
            if let Err(e) = manager.stop_screen_share().await {
                warn!("automatic screen share stop failed: {e}");
            }
        });
    })
}
