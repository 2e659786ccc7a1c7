//! Decodes audio files into interleaved `f32` samples for the output sink.
//!
//! [`SymphoniaSource`] probes the container with symphonia, decodes the
//! default track packet by packet and implements [`rodio::Source`], so a
//! session can append it to a `rodio::Sink` directly.
//!
//! A source opened by a session is *tracked*: every emitted frame advances
//! the session's [`Progress`], and reaching the end of the stream (or a fatal
//! read error) is reported once on the session's end channel together with
//! the cue generation the source was created for.
//!
//! Supported formats follow the enabled symphonia features: WAV/PCM, FLAC,
//! Ogg Vorbis, MKV and MP3.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use rodio::{ChannelCount, SampleRate, Source};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, error, warn};

mod progress;

pub use progress::Progress;
pub(crate) use progress::{duration_to_frames, frames_to_duration};

/// Descriptive tags read from the container, when present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl AudioMetadata {
    fn absorb(&mut self, revision: &MetadataRevision) {
        for tag in revision.tags() {
            let slot = match tag.std_key {
                Some(StandardTagKey::TrackTitle) => &mut self.title,
                Some(StandardTagKey::Artist) => &mut self.artist,
                Some(StandardTagKey::Album) => &mut self.album,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(tag.value.to_string());
            }
        }
    }
}

/// Format of an opened stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration: Option<Duration>,
    pub metadata: AudioMetadata,
}

/// End-of-stream report from a tracked source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamEnd {
    pub generation: u64,
    /// `Some` when the stream stopped on an unrecoverable error.
    pub error: Option<String>,
}

struct Tracker {
    progress: Arc<Progress>,
    ends: Sender<StreamEnd>,
    generation: u64,
}

/// One decoding pass over a file, from its start or a seek target.
pub struct SymphoniaSource {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    info: StreamInfo,
    samples: Option<SampleBuffer<f32>>,
    samples_frames: usize,
    filled: usize,
    cursor: usize,
    frame_offset: u16,
    skip_frames: u64,
    decode_errors: u32,
    max_decode_errors: u32,
    tracker: Option<Tracker>,
    finished: bool,
    /// Positioned at the end; the next pull reports end of stream.
    at_end: bool,
    /// Only the first packet has been decoded and nothing was read yet.
    fresh: bool,
}

impl SymphoniaSource {
    /// Opens `path`, probes its container and decodes the first packet.
    ///
    /// # Errors
    ///
    /// `NotFound` if the file cannot be opened, `UnsupportedFormat` if no
    /// decodable audio track is found.
    pub fn open(path: &Path, max_decode_errors: u32) -> Result<Self, crate::PlayerError> {
        let not_found = |reason: String| crate::PlayerError::NotFound {
            path: path.to_path_buf(),
            reason,
        };
        let unsupported = |reason: String| crate::PlayerError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| not_found(e.to_string()))?;
        let meta = file.metadata().map_err(|e| not_found(e.to_string()))?;
        if !meta.is_file() {
            return Err(not_found("not a regular file".to_string()));
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let mut probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| unsupported(e.to_string()))?;

        let mut metadata = AudioMetadata::default();
        if let Some(revision) = probed.format.metadata().current() {
            metadata.absorb(revision);
        }
        if let Some(probe_meta) = probed.metadata.get() {
            if let Some(revision) = probe_meta.current() {
                metadata.absorb(revision);
            }
        }

        let format = probed.format;
        let track = format
            .default_track()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .or_else(|| {
                format
                    .tracks()
                    .iter()
                    .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            })
            .ok_or_else(|| unsupported("no audio track".to_string()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| unsupported(e.to_string()))?;

        let sample_rate = params.sample_rate.unwrap_or(0);
        let duration = match (params.n_frames, params.time_base) {
            (Some(frames), _) if sample_rate > 0 => Some(frames_to_duration(frames, sample_rate)),
            (Some(frames), Some(tb)) => Some(time_to_duration(tb.calc_time(frames))),
            _ => None,
        };

        let mut source = Self {
            path: path.to_path_buf(),
            format,
            decoder,
            track_id,
            time_base: params.time_base,
            info: StreamInfo {
                sample_rate,
                channels: params.channels.map(|c| c.count() as u16).unwrap_or(0),
                duration,
                metadata,
            },
            samples: None,
            samples_frames: 0,
            filled: 0,
            cursor: 0,
            frame_offset: 0,
            skip_frames: 0,
            decode_errors: 0,
            max_decode_errors,
            tracker: None,
            finished: false,
            at_end: false,
            fresh: false,
        };

        // Decoding the first packet settles the real output format and
        // rejects files whose codec cannot actually be decoded.
        match source.refill() {
            Ok(true) => {}
            Ok(false) => return Err(unsupported("no audio frames".to_string())),
            Err(reason) => return Err(unsupported(reason)),
        }
        if source.info.sample_rate == 0 || source.info.channels == 0 {
            return Err(unsupported("unknown sample rate or channel count".to_string()));
        }
        source.fresh = true;

        debug!(
            path = %source.path.display(),
            sample_rate = source.info.sample_rate,
            channels = source.info.channels,
            duration_ms = ?source.info.duration.map(|d| d.as_millis()),
            "opened stream"
        );
        Ok(source)
    }

    /// Format and tags read when the file was opened.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Reports progress and end of stream to a session.
    pub(crate) fn track(
        &mut self,
        progress: Arc<Progress>,
        ends: Sender<StreamEnd>,
        generation: u64,
    ) {
        self.tracker = Some(Tracker {
            progress,
            ends,
            generation,
        });
    }

    /// Positions the stream so the next sample is the one at `position`.
    ///
    /// A position at or past the known duration leaves the source exhausted.
    pub fn seek(&mut self, position: Duration) -> Result<(), String> {
        if position.is_zero() && self.fresh {
            return Ok(());
        }
        self.fresh = false;
        self.filled = 0;
        self.cursor = 0;
        self.frame_offset = 0;
        self.skip_frames = 0;
        self.finished = false;
        self.at_end = false;

        if self.info.duration.is_some_and(|d| position >= d) {
            self.at_end = true;
            return Ok(());
        }
        let time = Time::new(position.as_secs(), f64::from(position.subsec_nanos()) / 1e9);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| format!("seek to {} ms failed: {e}", position.as_millis()))?;
        self.decoder.reset();

        let gap = seeked.required_ts.saturating_sub(seeked.actual_ts);
        self.skip_frames = match self.time_base {
            Some(tb) => duration_to_frames(time_to_duration(tb.calc_time(gap)), self.info.sample_rate),
            None => gap,
        };
        Ok(())
    }

    /// Decodes the next packet of our track into the sample buffer.
    ///
    /// `Ok(false)` is the end of the stream, `Err` an unrecoverable failure.
    fn refill(&mut self) -> Result<bool, String> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(format!("read failed: {e}")),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(reason)) => {
                    self.decode_errors += 1;
                    warn!(path = %self.path.display(), reason, "skipping undecodable packet");
                    if self.decode_errors > self.max_decode_errors {
                        return Err(format!(
                            "{} consecutive undecodable packets: {reason}",
                            self.decode_errors
                        ));
                    }
                    continue;
                }
                Err(e) => return Err(format!("decode failed: {e}")),
            };
            self.decode_errors = 0;

            let spec = *decoded.spec();
            let channels = spec.channels.count() as u16;
            if self.info.channels == 0 {
                self.info.channels = channels;
            } else if self.info.channels != channels {
                return Err(format!(
                    "channel count changed from {} to {channels}",
                    self.info.channels
                ));
            }
            if self.info.sample_rate == 0 {
                self.info.sample_rate = spec.rate;
            }
            if decoded.frames() == 0 {
                continue;
            }

            if self.samples.is_none() || self.samples_frames < decoded.capacity() {
                self.samples_frames = decoded.capacity();
                self.samples = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            }
            let Some(buf) = self.samples.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);
            self.filled = buf.len();
            self.cursor = 0;

            if self.skip_frames > 0 {
                let frames = (self.filled / usize::from(channels.max(1))) as u64;
                let skipped = self.skip_frames.min(frames);
                self.skip_frames -= skipped;
                self.cursor = skipped as usize * usize::from(channels);
                if self.cursor >= self.filled {
                    continue;
                }
            }
            return Ok(true);
        }
    }

    fn finish(&mut self, error: Option<String>) {
        self.finished = true;
        if let Some(tracker) = &self.tracker {
            tracker.progress.mark_started();
            // The session may already be gone.
            let _ = tracker.ends.send(StreamEnd {
                generation: tracker.generation,
                error,
            });
        }
    }
}

impl Iterator for SymphoniaSource {
    type Item = rodio::Sample;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cursor < self.filled {
                self.fresh = false;
                let sample = self.samples.as_ref()?.samples()[self.cursor];
                self.cursor += 1;
                self.frame_offset += 1;
                if self.frame_offset >= self.info.channels {
                    self.frame_offset = 0;
                    if let Some(tracker) = &self.tracker {
                        tracker.progress.advance();
                    }
                }
                return Some(sample);
            }
            if self.finished {
                return None;
            }
            if self.at_end {
                self.finish(None);
                return None;
            }
            match self.refill() {
                Ok(true) => continue,
                Ok(false) => {
                    debug!(path = %self.path.display(), "end of stream");
                    self.finish(None);
                    return None;
                }
                Err(reason) => {
                    error!(path = %self.path.display(), %reason, "stream failed");
                    self.finish(Some(reason));
                    return None;
                }
            }
        }
    }
}

impl Source for SymphoniaSource {
    #[inline]
    fn current_span_len(&self) -> Option<usize> {
        None
    }

    #[inline]
    fn channels(&self) -> ChannelCount {
        self.info.channels
    }

    #[inline]
    fn sample_rate(&self) -> SampleRate {
        self.info.sample_rate
    }

    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        self.info.duration
    }
}

fn time_to_duration(time: Time) -> Duration {
    Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::write_wav;

    #[test]
    fn opens_pcm_wav() {
        let wav = write_wav(8_000, 2, 500);
        let source = SymphoniaSource::open(wav.path(), 3).unwrap();
        let info = source.info();
        assert_eq!(info.sample_rate, 8_000);
        assert_eq!(info.channels, 2);
        assert_eq!(info.duration, Some(Duration::from_millis(500)));
    }

    #[test]
    fn yields_every_sample_then_reports_end() {
        let wav = write_wav(8_000, 1, 250);
        let mut source = SymphoniaSource::open(wav.path(), 3).unwrap();
        let progress = Arc::new(Progress::new(8_000));
        let (tx, rx) = crossbeam_channel::unbounded();
        source.track(progress.clone(), tx, 7);

        let count = source.by_ref().count();
        assert_eq!(count, 2_000);
        assert_eq!(progress.frames(), 2_000);
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEnd {
                generation: 7,
                error: None
            }
        );
        assert!(source.next().is_none());
        assert!(rx.try_recv().is_err(), "end is reported once");
    }

    #[test]
    fn seek_skips_to_requested_frame() {
        let wav = write_wav(8_000, 1, 1_000);
        let mut source = SymphoniaSource::open(wav.path(), 3).unwrap();
        source.seek(Duration::from_millis(600)).unwrap();
        let remaining = source.count();
        assert!((3_198..=3_202).contains(&remaining), "remaining {remaining}");
    }

    #[test]
    fn seek_to_duration_exhausts_source() {
        let wav = write_wav(8_000, 1, 300);
        let mut source = SymphoniaSource::open(wav.path(), 3).unwrap();
        let progress = Arc::new(Progress::new(8_000));
        let (tx, rx) = crossbeam_channel::unbounded();
        source.track(progress, tx, 1);
        source.seek(Duration::from_millis(300)).unwrap();
        assert!(source.next().is_none());
        assert_eq!(rx.try_recv().unwrap().generation, 1);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = SymphoniaSource::open(Path::new("/no/such/file.wav"), 3).unwrap_err();
        assert!(matches!(err, crate::PlayerError::NotFound { .. }));
    }

    #[test]
    fn directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = SymphoniaSource::open(dir.path(), 3).unwrap_err();
        assert!(matches!(err, crate::PlayerError::NotFound { .. }));
    }

    #[test]
    fn garbage_is_unsupported() {
        let file = crate::test_util::write_bytes(".wav", b"definitely not a riff header at all");
        let err = SymphoniaSource::open(file.path(), 3).unwrap_err();
        assert!(matches!(err, crate::PlayerError::UnsupportedFormat { .. }));
    }
}
