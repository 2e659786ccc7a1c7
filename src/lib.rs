// Audio Transport Library

pub mod config;
mod control;
pub mod decoder;
pub mod error;
pub mod events;
pub mod output;
pub mod player;
mod session;
pub mod state;

#[cfg(test)]
mod test_util;

pub use config::{OutputBackend, PlayerConfig};
pub use decoder::{AudioMetadata, StreamInfo};
pub use error::{ConfigError, PlayerError};
pub use events::{EventCallback, PlaybackEvent};
pub use player::{AudioPlayer, Blocking, Completion};
pub use state::{PlayerState, PlayerStatus};
