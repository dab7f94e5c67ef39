//! Media track and stream handles
//!
//! A `MediaTrack` is a shared handle to a single audio or video source.
//! Capture backends push samples into it; negotiation backends subscribe
//! to forward them. The `enabled` flag flips without stopping the track,
//! which is what makes mute/camera-off free of renegotiation.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Sample fan-out capacity per track
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Where a track's media comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
    Remote,
}

/// Payload format of a media sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Interleaved signed 16-bit little-endian PCM (audio)
    PcmS16,
    /// Codec-specific encoded payload (passed through opaque)
    Encoded,
}

/// A single chunk of media data
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
    pub format: SampleFormat,
}

impl MediaSample {
    pub fn pcm(data: Bytes, duration: Duration) -> Self {
        Self {
            data,
            duration,
            format: SampleFormat::PcmS16,
        }
    }

    pub fn encoded(data: Bytes, duration: Duration) -> Self {
        Self {
            data,
            duration,
            format: SampleFormat::Encoded,
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    device_id: Option<String>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    /// Fires once when the track ends (stopped locally or by the capture source)
    ended_tx: watch::Sender<bool>,
    samples: broadcast::Sender<MediaSample>,
    /// Last audio energy reading, f32 bits, 0-255 scale
    energy: AtomicU32,
}

/// Shared handle to a single audio or video source
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource, device_id: Option<String>) -> Self {
        let (ended_tx, _) = watch::channel(false);
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                source,
                device_id,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                ended_tx,
                samples,
                energy: AtomicU32::new(0f32.to_bits()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Flip `enabled` and return the new state. Never stops the track.
    pub fn toggle(&self) -> bool {
        // fetch_xor returns the previous value
        !self.inner.enabled.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Whether the track is live (not stopped)
    pub fn is_live(&self) -> bool {
        !self.is_stopped()
    }

    /// Stop the track. Idempotent; fires the `ended` notification once.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!(track = %self.inner.id, kind = %self.inner.kind, "track stopped");
            let _ = self.inner.ended_tx.send(true);
        }
    }

    /// Subscribe to the end-of-track notification.
    ///
    /// The receiver observes `true` once the track has ended, whether it
    /// was stopped locally or by the capture source (e.g. the user ending
    /// a display capture from the system UI).
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.inner.ended_tx.subscribe()
    }

    /// Push a captured sample into the track.
    ///
    /// Disabled or stopped tracks swallow samples, so a muted microphone
    /// transmits nothing and reads as zero energy. PCM audio samples also
    /// update the energy reading used by the activity detector.
    pub fn push_sample(&self, sample: MediaSample) {
        if self.is_stopped() || !self.is_enabled() {
            return;
        }
        if self.inner.kind == TrackKind::Audio && sample.format == SampleFormat::PcmS16 {
            self.set_energy(pcm_energy(&sample.data));
        }
        let _ = self.inner.samples.send(sample);
    }

    /// Subscribe to the sample fan-out (negotiation backends, recorders)
    pub fn subscribe_samples(&self) -> broadcast::Receiver<MediaSample> {
        self.inner.samples.subscribe()
    }

    /// Overwrite the energy reading directly.
    ///
    /// For backends that compute levels outside the sample path (decoded
    /// remote audio, hardware meters).
    pub fn set_energy(&self, energy: f32) {
        self.inner
            .energy
            .store(energy.clamp(0.0, 255.0).to_bits(), Ordering::Release);
    }

    /// Current audio energy on a 0-255 scale.
    ///
    /// `None` for video tracks and stopped tracks; a disabled (muted)
    /// track reads as zero.
    pub fn audio_energy(&self) -> Option<f32> {
        if self.inner.kind != TrackKind::Audio || self.is_stopped() {
            return None;
        }
        if !self.is_enabled() {
            return Some(0.0);
        }
        Some(f32::from_bits(self.inner.energy.load(Ordering::Acquire)))
    }

    /// Whether two handles refer to the same underlying track
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Mean absolute amplitude of interleaved s16le PCM scaled to 0-255
fn pcm_energy(data: &Bytes) -> f32 {
    if data.len() < 2 {
        return 0.0;
    }
    let mut sum = 0u64;
    let mut count = 0u64;
    for chunk in data.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        sum += sample.unsigned_abs() as u64;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum as f32 / count as f32) / 32768.0 * 255.0
}

struct StreamInner {
    id: String,
    tracks: RwLock<Vec<MediaTrack>>,
}

/// Shared handle to an ordered set of tracks
///
/// The local stream keeps a stable identity across track replacement, so
/// peer connections and the activity detector observe device switches
/// without re-wiring.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: uuid::Uuid::new_v4().to_string(),
                tracks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn with_tracks(tracks: Vec<MediaTrack>) -> Self {
        let stream = Self::new();
        *stream.inner.tracks.write() = tracks;
        stream
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Snapshot of all tracks
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.inner.tracks.read().clone()
    }

    /// Snapshot of all live tracks of a kind
    pub fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind && t.is_live())
            .cloned()
            .collect()
    }

    /// First live track of a kind
    pub fn first_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.tracks_of(kind).into_iter().next()
    }

    pub fn add_track(&self, track: MediaTrack) {
        self.inner.tracks.write().push(track);
    }

    /// Remove a track by id without stopping it
    pub fn remove_track(&self, track_id: &str) -> Option<MediaTrack> {
        let mut tracks = self.inner.tracks.write();
        let pos = tracks.iter().position(|t| t.id() == track_id)?;
        Some(tracks.remove(pos))
    }

    /// Stop every track and clear the set. Idempotent.
    pub fn stop_all(&self) {
        let drained: Vec<MediaTrack> = self.inner.tracks.write().drain(..).collect();
        for track in drained {
            track.stop();
        }
    }

    /// Whether any track is still live
    pub fn is_live(&self) -> bool {
        self.inner.tracks.read().iter().any(|t| t.is_live())
    }

    /// Combined audio energy: the loudest live audio track's reading.
    ///
    /// `None` when no live audio track exists, which a polling caller
    /// must treat as "stream torn down or audio-less", not an error.
    pub fn audio_energy(&self) -> Option<f32> {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.kind() == TrackKind::Audio)
            .filter_map(|t| t.audio_energy())
            .fold(None, |acc, e| Some(acc.map_or(e, |a: f32| a.max(e))))
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.read().len())
            .finish()
    }
}
