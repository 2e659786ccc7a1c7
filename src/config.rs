use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where decoded samples go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputBackend {
    /// The host's audio device via cpal.
    #[default]
    Device,
    /// No hardware; sinks are drained at real time by a pump thread.
    Null,
}

/// Engine settings.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// output = "null"
/// volume = 0.5
/// start_timeout_ms = 1000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Output backend, `device` or `null`.
    pub output: OutputBackend,
    /// Output device name; the host default when unset.
    pub device_name: Option<String>,
    /// Initial volume, 0.0..=1.0.
    pub volume: f32,
    /// How long `play` waits for the output to pull its first samples.
    pub start_timeout_ms: u64,
    /// How long a playing stream may go without progress before it is
    /// treated as a device failure.
    pub stall_timeout_ms: u64,
    /// Control thread housekeeping interval.
    pub tick_interval_ms: u64,
    /// Consecutive undecodable packets tolerated before the stream fails.
    pub max_decode_errors: u32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            output: OutputBackend::Device,
            device_name: None,
            volume: 1.0,
            start_timeout_ms: 2_000,
            stall_timeout_ms: 3_000,
            tick_interval_ms: 50,
            max_decode_errors: 3,
        }
    }
}

impl PlayerConfig {
    /// Default settings with the null output, for headless use.
    pub fn headless() -> Self {
        Self {
            output: OutputBackend::Null,
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PlayerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(ConfigError::Invalid {
                field: "volume",
                reason: format!("{} is outside 0.0..=1.0", self.volume),
            });
        }
        for (field, value) in [
            ("start_timeout_ms", self.start_timeout_ms),
            ("stall_timeout_ms", self.stall_timeout_ms),
            ("tick_interval_ms", self.tick_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub(crate) fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub(crate) fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
