use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::config::PlayerConfig;
use crate::decoder::{Progress, StreamEnd, StreamInfo, SymphoniaSource};
use crate::error::PlayerError;
use crate::output::{AudioOutput, OutputFactory, OutputSink};

const SETTLE_INTERVAL: Duration = Duration::from_millis(25);
const SETTLE_TIMEOUT: Duration = Duration::from_millis(250);

/// Everything owned for one loaded file.
///
/// Lives on the control thread. Dropping it stops the sink and releases the
/// output device.
pub(crate) struct Session {
    path: PathBuf,
    info: StreamInfo,
    max_decode_errors: u32,
    // Declared before `output` so the sink is gone before its device.
    sink: Option<OutputSink>,
    output: Box<dyn AudioOutput>,
    progress: Arc<Progress>,
    ends: Sender<StreamEnd>,
    generation: u64,
}

impl Session {
    /// Opens `path` and cues it paused at the start.
    pub(crate) fn open(
        path: &Path,
        config: &PlayerConfig,
        open_output: OutputFactory,
        ends: Sender<StreamEnd>,
        volume: f32,
    ) -> Result<Self, PlayerError> {
        let source = SymphoniaSource::open(path, config.max_decode_errors)?;
        let info = source.info().clone();
        let output = open_output(config, &info)?;

        let mut session = Self {
            path: path.to_path_buf(),
            progress: Arc::new(Progress::new(info.sample_rate)),
            info,
            max_decode_errors: config.max_decode_errors,
            sink: None,
            output,
            ends,
            generation: 0,
        };
        session.install(source, Duration::ZERO, true, volume)?;
        info!(path = %session.path.display(), output = session.output.name(), "session opened");
        Ok(session)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn frames(&self) -> u64 {
        self.progress.frames()
    }

    pub(crate) fn position(&self) -> Duration {
        self.progress.position()
    }

    /// Rebuilds the sink with a fresh decoder positioned at `position`.
    ///
    /// The current sink keeps playing until the new source and sink are both
    /// ready, so a failed cue leaves the session untouched.
    pub(crate) fn cue(
        &mut self,
        position: Duration,
        paused: bool,
        volume: f32,
    ) -> Result<(), PlayerError> {
        let mut source = SymphoniaSource::open(&self.path, self.max_decode_errors)?;
        source
            .seek(position)
            .map_err(|reason| {
                debug!(%reason, "cue failed");
                PlayerError::InvalidPosition {
                    offset_ms: i64::try_from(position.as_millis()).unwrap_or(i64::MAX),
                    duration_ms: self.duration_ms(),
                }
            })?;
        self.install(source, position, paused, volume)
    }

    fn install(
        &mut self,
        mut source: SymphoniaSource,
        position: Duration,
        paused: bool,
        volume: f32,
    ) -> Result<(), PlayerError> {
        let sink = self.output.open_sink()?;
        sink.set_volume(volume);
        if paused {
            sink.pause();
        }

        self.sink = None;
        self.generation += 1;
        source.track(self.progress.clone(), self.ends.clone(), self.generation);
        self.progress.set_position(position);
        sink.append(source);
        self.sink = Some(sink);
        debug!(
            generation = self.generation,
            position_ms = position.as_millis() as u64,
            paused,
            "cued"
        );
        Ok(())
    }

    /// Resumes output and waits until it actually pulls samples.
    ///
    /// A sink whose source has already run out is replaced by a fresh cue
    /// from the start.
    pub(crate) fn play(&mut self, volume: f32, timeout: Duration) -> Result<(), PlayerError> {
        if self.sink.as_ref().map_or(true, |sink| sink.empty()) {
            self.cue(Duration::ZERO, true, volume)?;
        }
        let Some(sink) = self.sink.as_ref() else {
            return Err(PlayerError::NoSourceLoaded);
        };

        self.progress.arm_start();
        sink.play();
        if self.progress.wait_started(timeout) {
            Ok(())
        } else {
            sink.pause();
            Err(PlayerError::DeviceError(format!(
                "output did not start within {} ms",
                timeout.as_millis()
            )))
        }
    }

    /// Halts output and waits for the position to settle.
    pub(crate) fn pause(&mut self) {
        if let Some(sink) = self.sink.as_ref() {
            sink.pause();
            self.progress.wait_settled(SETTLE_INTERVAL, SETTLE_TIMEOUT);
        }
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        if let Some(sink) = self.sink.as_ref() {
            sink.set_volume(volume);
        }
    }

    /// Drops the drained sink after end of stream and rewinds to the start.
    /// The next `play` cues a new source.
    pub(crate) fn rewind_after_end(&mut self) {
        self.sink = None;
        self.progress.set_position(Duration::ZERO);
    }

    pub(crate) fn duration_ms(&self) -> Option<u64> {
        self.info
            .duration
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.sink = None;
        debug!(path = %self.path.display(), "session released");
    }
}
