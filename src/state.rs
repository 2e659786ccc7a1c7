use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::decoder::AudioMetadata;

/// Transport state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlayerState {
    /// Nothing loaded yet
    #[default]
    Empty,
    /// A load is being executed
    Loading,
    /// Loaded and not playing; position retained
    Ready,
    /// Output is pulling samples
    Playing,
    /// Terminal until the next successful load
    Error,
}

impl PlayerState {
    /// Whether transport operations other than `load` can act on this state.
    pub fn has_source(self) -> bool {
        matches!(self, PlayerState::Ready | PlayerState::Playing)
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayerState::Empty => "empty",
            PlayerState::Loading => "loading",
            PlayerState::Ready => "ready",
            PlayerState::Playing => "playing",
            PlayerState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Snapshot returned by [`AudioPlayer::status`](crate::AudioPlayer::status).
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatus {
    pub state: PlayerState,
    /// Position of the loaded stream; zero when nothing is loaded
    pub position: Duration,
    /// Total length, when the container declares it
    pub duration: Option<Duration>,
    /// Output gain, 0.0..=1.0
    pub volume: f32,
    /// Loaded file
    pub path: Option<PathBuf>,
    pub metadata: Option<AudioMetadata>,
}
