//! Audio activity detection
//!
//! Polls the audio energy of watched streams on a fixed cadence and
//! reports edge-triggered speaking transitions. One poll task per
//! watched stream; a stream whose audio disappears mid-watch (teardown
//! during a poll) simply reads as silent, never as an error.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SpeakingConfig;
use crate::media::MediaStream;

/// An edge-triggered speaking transition for one watched stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    /// Caller-chosen key identifying the watched stream
    pub key: String,
    pub speaking: bool,
}

struct WatchEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Polls watched streams and reports speaking transitions
pub struct AudioActivityDetector {
    threshold: f32,
    interval: Duration,
    hold: Duration,
    events: mpsc::Sender<ActivityEvent>,
    entries: Mutex<HashMap<String, WatchEntry>>,
}

impl AudioActivityDetector {
    pub fn new(config: &SpeakingConfig, events: mpsc::Sender<ActivityEvent>) -> Arc<Self> {
        Arc::new(Self {
            threshold: config.threshold,
            interval: config.poll_interval(),
            hold: config.hold(),
            events,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Watch a stream under a key.
    ///
    /// Re-watching an existing key replaces the watched stream; the
    /// replacement starts from not-speaking, so a transition on the new
    /// stream is always reported.
    pub fn watch(&self, key: impl Into<String>, stream: MediaStream) {
        let key = key.into();
        let cancel = CancellationToken::new();
        let task = self.spawn_poll_task(key.clone(), stream, cancel.clone());

        let previous = self
            .entries
            .lock()
            .insert(key.clone(), WatchEntry { cancel, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
            debug!(key, "activity watch replaced");
        } else {
            debug!(key, "activity watch started");
        }
    }

    /// Stop watching a key. Unknown keys are a no-op.
    pub fn unwatch(&self, key: &str) {
        if let Some(entry) = self.entries.lock().remove(key) {
            entry.cancel.cancel();
            debug!(key, "activity watch stopped");
        }
    }

    /// Stop watching everything
    pub fn clear(&self) {
        let drained: Vec<WatchEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "activity watches cleared");
        }
    }

    pub fn watched_count(&self) -> usize {
        self.entries.lock().len()
    }

    fn spawn_poll_task(
        &self,
        key: String,
        stream: MediaStream,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let threshold = self.threshold;
        let hold = self.hold;
        let interval = self.interval;
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut speaking = false;
            let mut last_above: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // A watch removed while speaking reports the drop
                        if speaking {
                            let _ = events
                                .send(ActivityEvent {
                                    key: key.clone(),
                                    speaking: false,
                                })
                                .await;
                        }
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                // A torn-down or audio-less stream reads as silence
                let energy = stream.audio_energy().unwrap_or(0.0);
                let now = Instant::now();
                if energy > threshold {
                    last_above = Some(now);
                }

                let next = match last_above {
                    Some(t) => now.duration_since(t) <= hold,
                    None => false,
                };
                if next != speaking {
                    speaking = next;
                    if events
                        .send(ActivityEvent {
                            key: key.clone(),
                            speaking,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        })
    }
}

impl Drop for AudioActivityDetector {
    fn drop(&mut self) {
        for (_, entry) in self.entries.lock().drain() {
            entry.cancel.cancel();
        }
    }
}
