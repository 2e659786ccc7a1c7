use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PlayerConfig;
use crate::control::{Command, Controller, Reply};
use crate::error::PlayerError;
use crate::events::{spawn_dispatcher, CallbackSlot, PlaybackEvent};
use crate::output;
use crate::state::PlayerStatus;

/// Resolves when the engine has applied (or rejected) an operation.
///
/// The operation is queued when the method returning the `Completion` is
/// called, not when the future is first polled, so calls keep their order
/// even if their completions are awaited out of order or dropped.
#[must_use = "the operation is queued either way; await to learn its outcome"]
pub struct Completion<T = ()> {
    inner: Inner<T>,
}

enum Inner<T> {
    Pending(oneshot::Receiver<Result<T, PlayerError>>),
    Rejected(Option<PlayerError>),
}

impl<T> Future for Completion<T> {
    type Output = Result<T, PlayerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(PlayerError::EngineStopped))),
            Inner::Rejected(err) => {
                Poll::Ready(Err(err.take().unwrap_or(PlayerError::EngineStopped)))
            }
        }
    }
}

/// Single-stream audio player.
///
/// Every transport operation is executed by a background control thread in
/// the order it was called; events are delivered to the subscriber on a
/// separate dispatch thread.
///
/// ```no_run
/// # async fn demo() -> Result<(), audio_transport::PlayerError> {
/// use audio_transport::AudioPlayer;
///
/// let player = AudioPlayer::new()?;
/// player.set_event_callback(|event, message| println!("{event}: {message}"));
/// player.load("piano.wav").await?;
/// player.seek(2_000).await?;
/// player.play().await?;
/// # Ok(())
/// # }
/// ```
pub struct AudioPlayer {
    commands: Sender<Command>,
    callback: CallbackSlot,
    pending_load: Mutex<Option<CancellationToken>>,
    control: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl AudioPlayer {
    /// A player on the default output device.
    pub fn new() -> Result<Self, PlayerError> {
        Self::with_config(PlayerConfig::default())
    }

    /// A player using `config`, e.g. [`PlayerConfig::headless`].
    pub fn with_config(config: PlayerConfig) -> Result<Self, PlayerError> {
        let callback = CallbackSlot::default();
        let (events, dispatcher) =
            spawn_dispatcher(callback.clone()).map_err(PlayerError::device)?;
        let (commands, control) = Controller::spawn(config, events)?;

        Ok(Self {
            commands,
            callback,
            pending_load: Mutex::new(None),
            control: Some(control),
            dispatcher: Some(dispatcher),
        })
    }

    /// Names of the host's output devices, for `PlayerConfig::device_name`.
    pub fn output_devices() -> Result<Vec<String>, PlayerError> {
        output::output_devices()
    }

    /// Replaces the loaded file. A load still waiting in the queue when
    /// another one is issued resolves with [`PlayerError::Superseded`].
    pub fn load(&self, path: impl AsRef<Path>) -> Completion {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.pending_load.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        let path = path.as_ref().to_path_buf();
        self.request(|reply| Command::Load {
            path,
            cancel,
            reply,
        })
    }

    /// Starts or resumes output; resolves once samples are flowing.
    pub fn play(&self) -> Completion {
        self.request(|reply| Command::Play { reply })
    }

    /// Halts output, keeping the position. Resolves once output has stopped.
    pub fn pause(&self) -> Completion {
        self.request(|reply| Command::Pause { reply })
    }

    /// Moves to `offset_ms` without changing whether the player is playing.
    pub fn seek(&self, offset_ms: i64) -> Completion {
        self.request(|reply| Command::Seek { offset_ms, reply })
    }

    /// Halts output and rewinds to the start.
    pub fn stop(&self) -> Completion {
        self.request(|reply| Command::Stop { reply })
    }

    /// Output gain, clamped to `0.0..=1.0`. Kept across loads.
    pub fn set_volume(&self, volume: f32) -> Completion {
        self.request(|reply| Command::SetVolume { volume, reply })
    }

    /// Snapshot taken after every operation issued before it.
    pub fn status(&self) -> Completion<PlayerStatus> {
        self.request(|reply| Command::Status { reply })
    }

    /// Installs the single event subscriber, replacing any previous one.
    ///
    /// Once this returns, the previous callback receives no further events.
    /// Callbacks run on the dispatch thread and must not call
    /// `set_event_callback` or `clear_event_callback` themselves.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(PlaybackEvent, &str) + Send + 'static,
    {
        self.callback.replace(Some(Box::new(callback)));
    }

    /// Removes the subscriber; later events are dropped.
    pub fn clear_event_callback(&self) {
        self.callback.replace(None);
    }

    /// Synchronous facade for callers without an async runtime.
    pub fn blocking(&self) -> Blocking<'_> {
        Blocking { player: self }
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Completion<T> {
        let (reply, rx) = oneshot::channel();
        let inner = match self.commands.send(command(reply)) {
            Ok(()) => Inner::Pending(rx),
            Err(_) => Inner::Rejected(Some(PlayerError::EngineStopped)),
        };
        Completion { inner }
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.control.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher.take() {
            // Dropping the player from inside a callback must not self-join.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!("player dropped");
    }
}

/// Runs each operation to completion on the calling thread.
///
/// Do not use from inside an async task; it blocks the executor thread.
pub struct Blocking<'a> {
    player: &'a AudioPlayer,
}

impl Blocking<'_> {
    /// Blocking [`AudioPlayer::load`].
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), PlayerError> {
        futures::executor::block_on(self.player.load(path))
    }

    /// Blocking [`AudioPlayer::play`].
    pub fn play(&self) -> Result<(), PlayerError> {
        futures::executor::block_on(self.player.play())
    }

    /// Blocking [`AudioPlayer::pause`].
    pub fn pause(&self) -> Result<(), PlayerError> {
        futures::executor::block_on(self.player.pause())
    }

    /// Blocking [`AudioPlayer::seek`].
    pub fn seek(&self, offset_ms: i64) -> Result<(), PlayerError> {
        futures::executor::block_on(self.player.seek(offset_ms))
    }

    /// Blocking [`AudioPlayer::stop`].
    pub fn stop(&self) -> Result<(), PlayerError> {
        futures::executor::block_on(self.player.stop())
    }

    /// Blocking [`AudioPlayer::set_volume`].
    pub fn set_volume(&self, volume: f32) -> Result<(), PlayerError> {
        futures::executor::block_on(self.player.set_volume(volume))
    }

    /// Blocking [`AudioPlayer::status`].
    pub fn status(&self) -> Result<PlayerStatus, PlayerError> {
        futures::executor::block_on(self.player.status())
    }
}
