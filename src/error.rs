use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by transport operations.
///
/// Operation-local failures resolve the operation's [`Completion`](crate::Completion)
/// with one of these; failures that happen while the stream is running are
/// reported through [`PlaybackEvent::Error`](crate::PlaybackEvent::Error) instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlayerError {
    #[error("cannot open {}: {reason}", path.display())]
    NotFound { path: PathBuf, reason: String },

    #[error("unsupported format for {}: {reason}", path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("no source loaded")]
    NoSourceLoaded,

    #[error("position {offset_ms} ms is outside 0..={duration_ms:?} ms")]
    InvalidPosition {
        offset_ms: i64,
        duration_ms: Option<u64>,
    },

    #[error("output device error: {0}")]
    DeviceError(String),

    #[error("volume {0} is not a number")]
    InvalidVolume(f32),

    /// A newer `load` was issued before this one started.
    #[error("load of {} superseded by a newer load", .0.display())]
    Superseded(PathBuf),

    #[error("player engine stopped")]
    EngineStopped,
}

impl PlayerError {
    pub(crate) fn device(err: impl std::fmt::Display) -> Self {
        Self::DeviceError(err.to_string())
    }
}

/// Failures while reading or validating a [`PlayerConfig`](crate::PlayerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
