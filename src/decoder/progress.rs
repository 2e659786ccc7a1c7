use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Playback position shared between the pulling thread and the control thread.
///
/// The decoder counts every frame it hands to the output. Because the sink's
/// pause stage stops pulling from the decoder, the counter only moves while
/// output is really running.
pub struct Progress {
    sample_rate: u32,
    frames: AtomicU64,
    armed: AtomicBool,
    started: Mutex<bool>,
    started_cv: Condvar,
}

impl Progress {
    /// A counter at position zero for a stream at `sample_rate`.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            frames: AtomicU64::new(0),
            armed: AtomicBool::new(false),
            started: Mutex::new(false),
            started_cv: Condvar::new(),
        }
    }

    /// Frames handed to the output so far, counted from the stream start.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Current playback position.
    pub fn position(&self) -> Duration {
        frames_to_duration(self.frames(), self.sample_rate)
    }

    pub(crate) fn set_position(&self, position: Duration) {
        self.frames
            .store(duration_to_frames(position, self.sample_rate), Ordering::Release);
    }

    pub(crate) fn advance(&self) {
        self.frames.fetch_add(1, Ordering::AcqRel);
        if self.armed.load(Ordering::Acquire) {
            self.mark_started();
        }
    }

    /// Prepares for [`wait_started`](Self::wait_started). Must be called
    /// before the output is resumed.
    pub(crate) fn arm_start(&self) {
        *self.started.lock() = false;
        self.armed.store(true, Ordering::Release);
    }

    pub(crate) fn mark_started(&self) {
        self.armed.store(false, Ordering::Release);
        let mut started = self.started.lock();
        *started = true;
        self.started_cv.notify_all();
    }

    /// Blocks until a frame was pulled (or the stream ended) after
    /// [`arm_start`](Self::arm_start). Returns `false` on timeout.
    pub(crate) fn wait_started(&self, timeout: Duration) -> bool {
        let mut started = self.started.lock();
        if !*started {
            self.started_cv
                .wait_while_for(&mut started, |started| !*started, timeout);
        }
        self.armed.store(false, Ordering::Release);
        *started
    }

    /// Waits until the frame counter stops moving for one `interval`, giving
    /// up after `timeout`. Returns the settled frame count.
    pub(crate) fn wait_settled(&self, interval: Duration, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut last = self.frames();
        loop {
            std::thread::sleep(interval);
            let now = self.frames();
            if now == last || Instant::now() >= deadline {
                return now;
            }
            last = now;
        }
    }
}

pub(crate) fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    let nanos = u128::from(frames) * 1_000_000_000 / u128::from(sample_rate.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

pub(crate) fn duration_to_frames(position: Duration, sample_rate: u32) -> u64 {
    let frames = position.as_nanos() * u128::from(sample_rate) / 1_000_000_000;
    u64::try_from(frames).unwrap_or(u64::MAX)
}
