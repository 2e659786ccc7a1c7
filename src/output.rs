use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, OutputStreamBuilder, Sink, Source};
use tracing::{debug, info};

use crate::config::{OutputBackend, PlayerConfig};
use crate::decoder::StreamInfo;
use crate::error::PlayerError;

const NULL_TICK: Duration = Duration::from_millis(10);

/// Destination for a session's sinks.
///
/// An output lives on the control thread for as long as its session; dropping
/// it releases the device.
pub trait AudioOutput {
    /// Device name, for logs.
    fn name(&self) -> &str;

    /// Creates an idle sink feeding this output.
    fn open_sink(&self) -> Result<OutputSink, PlayerError>;
}

/// A rodio sink plus whatever keeps it drained.
///
/// Dropping it stops the sink first, then joins the pump thread if there is
/// one.
pub struct OutputSink {
    sink: Sink,
    _pump: Option<NullPump>,
}

impl Deref for OutputSink {
    type Target = Sink;

    fn deref(&self) -> &Sink {
        &self.sink
    }
}

/// Builds the output for a newly loaded stream.
pub(crate) type OutputFactory =
    fn(&PlayerConfig, &StreamInfo) -> Result<Box<dyn AudioOutput>, PlayerError>;

/// Opens the output configured for a session playing `info`.
pub(crate) fn open_output(
    config: &PlayerConfig,
    info: &StreamInfo,
) -> Result<Box<dyn AudioOutput>, PlayerError> {
    match config.output {
        OutputBackend::Device => Ok(Box::new(DeviceOutput::open(
            config.device_name.as_deref(),
            info.sample_rate,
            info.channels,
        )?)),
        OutputBackend::Null => Ok(Box::new(NullOutput)),
    }
}

/// Names of the host's output devices.
pub fn output_devices() -> Result<Vec<String>, PlayerError> {
    let host = cpal::default_host();
    let devices = host.output_devices().map_err(PlayerError::device)?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// The host audio device, opened at the stream's format when it allows it.
pub struct DeviceOutput {
    name: String,
    stream: OutputStream,
}

impl DeviceOutput {
    /// Opens `device_name` (or the host default) asking for the stream's
    /// format, falling back to the device's own format when refused.
    pub fn open(
        device_name: Option<&str>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, PlayerError> {
        let (name, builder) = match device_name {
            Some(wanted) => {
                let host = cpal::default_host();
                let device = host
                    .output_devices()
                    .map_err(PlayerError::device)?
                    .find(|d| d.name().is_ok_and(|n| n == wanted))
                    .ok_or_else(|| {
                        PlayerError::DeviceError(format!("no output device named {wanted}"))
                    })?;
                let builder =
                    OutputStreamBuilder::from_device(device).map_err(PlayerError::device)?;
                (wanted.to_string(), builder)
            }
            None => {
                let builder =
                    OutputStreamBuilder::from_default_device().map_err(PlayerError::device)?;
                ("default".to_string(), builder)
            }
        };

        let mut stream = builder
            .with_sample_rate(sample_rate)
            .with_channels(channels)
            .open_stream_or_fallback()
            .map_err(PlayerError::device)?;
        stream.log_on_drop(false);

        info!(device = %name, sample_rate, channels, "opened output device");
        Ok(Self { name, stream })
    }
}

impl AudioOutput for DeviceOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_sink(&self) -> Result<OutputSink, PlayerError> {
        Ok(OutputSink {
            sink: Sink::connect_new(self.stream.mixer()),
            _pump: None,
        })
    }
}

/// Discards audio at real-time pace.
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn name(&self) -> &str {
        "null"
    }

    fn open_sink(&self) -> Result<OutputSink, PlayerError> {
        let (sink, queue) = Sink::new();
        let pump = NullPump::spawn(queue)?;
        Ok(OutputSink {
            sink,
            _pump: Some(pump),
        })
    }
}

/// Output whose sinks are never pulled, as if the device hung.
#[cfg(test)]
pub(crate) struct StalledOutput;

#[cfg(test)]
impl AudioOutput for StalledOutput {
    fn name(&self) -> &str {
        "stalled"
    }

    fn open_sink(&self) -> Result<OutputSink, PlayerError> {
        let (sink, _queue) = Sink::new();
        Ok(OutputSink { sink, _pump: None })
    }
}

struct NullPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NullPump {
    fn spawn<S>(source: S) -> Result<Self, PlayerError>
    where
        S: Source + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("audio-null-out".to_string())
            .spawn(move || drain(source, flag))
            .map_err(PlayerError::device)?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for NullPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn drain<S: Source>(mut source: S, stop: Arc<AtomicBool>) {
    let mut deadline = Instant::now();
    while !stop.load(Ordering::Acquire) {
        let per_second = u64::from(source.sample_rate()) * u64::from(source.channels());
        let per_tick = (per_second * NULL_TICK.as_millis() as u64 / 1000).max(1);
        for _ in 0..per_tick {
            if source.next().is_none() {
                debug!("null output source exhausted");
                return;
            }
        }

        deadline += NULL_TICK;
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else {
            deadline = now;
        }
    }
}
