#![allow(dead_code)]

#[path = "../../src/test_util.rs"]
mod fixtures;

use std::sync::Arc;
use std::time::{Duration, Instant};

use audio_transport::{AudioPlayer, PlaybackEvent, PlayerConfig};
use parking_lot::Mutex;
use tempfile::NamedTempFile;

pub const SAMPLE_RATE: u32 = 44_100;

/// Headless player with timeouts short enough for tests.
pub fn player() -> AudioPlayer {
    let config = PlayerConfig {
        start_timeout_ms: 1_000,
        tick_interval_ms: 10,
        ..PlayerConfig::headless()
    };
    AudioPlayer::with_config(config).expect("player")
}

/// Stereo 16-bit PCM WAV of a quiet tone.
pub fn wav(duration_ms: u32) -> NamedTempFile {
    fixtures::write_wav(SAMPLE_RATE, 2, duration_ms)
}

pub fn file(suffix: &str, bytes: &[u8]) -> NamedTempFile {
    fixtures::write_bytes(suffix, bytes)
}

/// Collects every event delivered to the callback it installs.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<(PlaybackEvent, String)>>>,
}

impl Recorder {
    pub fn attach(player: &AudioPlayer) -> Self {
        let recorder = Self::default();
        let seen = recorder.seen.clone();
        player.set_event_callback(move |event, message| {
            seen.lock().push((event, message.to_string()));
        });
        recorder
    }

    pub fn events(&self) -> Vec<PlaybackEvent> {
        self.seen.lock().iter().map(|(event, _)| *event).collect()
    }

    pub fn message_of(&self, wanted: PlaybackEvent) -> Option<String> {
        self.seen
            .lock()
            .iter()
            .find(|(event, _)| *event == wanted)
            .map(|(_, message)| message.clone())
    }

    /// Waits until `event` has been delivered, up to `timeout`.
    pub async fn wait_for(&self, event: PlaybackEvent, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.events().contains(&event) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
