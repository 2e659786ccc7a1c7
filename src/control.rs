use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PlayerConfig;
use crate::decoder::StreamEnd;
use crate::error::PlayerError;
use crate::events::{EventSender, PlaybackEvent};
use crate::output::{self, OutputFactory};
use crate::session::Session;
use crate::state::{PlayerState, PlayerStatus};

pub(crate) type Reply<T = ()> = oneshot::Sender<Result<T, PlayerError>>;

/// Requests queued to the control thread, executed strictly in order.
pub(crate) enum Command {
    Load {
        path: PathBuf,
        cancel: CancellationToken,
        reply: Reply,
    },
    Play {
        reply: Reply,
    },
    Pause {
        reply: Reply,
    },
    Seek {
        offset_ms: i64,
        reply: Reply,
    },
    Stop {
        reply: Reply,
    },
    SetVolume {
        volume: f32,
        reply: Reply,
    },
    Status {
        reply: Reply<PlayerStatus>,
    },
    Shutdown,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Load { .. } => "load",
            Command::Play { .. } => "play",
            Command::Pause { .. } => "pause",
            Command::Seek { .. } => "seek",
            Command::Stop { .. } => "stop",
            Command::SetVolume { .. } => "set_volume",
            Command::Status { .. } => "status",
            Command::Shutdown => "shutdown",
        }
    }
}

struct Watchdog {
    frames: u64,
    since: Instant,
}

/// Owns the session and applies commands to it on a dedicated thread.
pub(crate) struct Controller {
    config: PlayerConfig,
    open_output: OutputFactory,
    commands: Receiver<Command>,
    ends_tx: Sender<StreamEnd>,
    ends_rx: Receiver<StreamEnd>,
    events: EventSender,
    state: PlayerState,
    session: Option<Session>,
    volume: f32,
    watchdog: Watchdog,
}

impl Controller {
    pub(crate) fn spawn(
        config: PlayerConfig,
        events: EventSender,
    ) -> Result<(Sender<Command>, JoinHandle<()>), PlayerError> {
        let (commands_tx, controller) = Self::new(config, output::open_output, events);
        let handle = thread::Builder::new()
            .name("audio-control".to_string())
            .spawn(move || controller.run())
            .map_err(PlayerError::device)?;
        Ok((commands_tx, handle))
    }

    fn new(
        config: PlayerConfig,
        open_output: OutputFactory,
        events: EventSender,
    ) -> (Sender<Command>, Self) {
        let (commands_tx, commands) = crossbeam_channel::unbounded();
        let (ends_tx, ends_rx) = crossbeam_channel::unbounded();
        let controller = Controller {
            volume: config.volume,
            config,
            open_output,
            commands,
            ends_tx,
            ends_rx,
            events,
            state: PlayerState::Empty,
            session: None,
            watchdog: Watchdog {
                frames: 0,
                since: Instant::now(),
            },
        };
        (commands_tx, controller)
    }

    fn run(mut self) {
        debug!("control thread started");
        let tick = self.config.tick_interval();
        loop {
            select! {
                recv(self.commands) -> command => match command {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(command) => self.handle(command),
                },
                recv(self.ends_rx) -> end => {
                    if let Ok(end) = end {
                        self.on_stream_end(end);
                    }
                },
                default(tick) => {},
            }
            self.check_stall();
        }
        self.session = None;
        debug!("control thread stopped");
    }

    fn handle(&mut self, command: Command) {
        // End reports queued ahead of the command are applied first.
        while let Ok(end) = self.ends_rx.try_recv() {
            self.on_stream_end(end);
        }

        let name = command.name();
        debug!(command = name, state = %self.state, "handling");
        match command {
            Command::Load {
                path,
                cancel,
                reply,
            } => respond(reply, name, self.load(path, cancel)),
            Command::Play { reply } => respond(reply, name, self.play()),
            Command::Pause { reply } => respond(reply, name, self.pause()),
            Command::Seek { offset_ms, reply } => respond(reply, name, self.seek(offset_ms)),
            Command::Stop { reply } => respond(reply, name, self.stop()),
            Command::SetVolume { volume, reply } => {
                respond(reply, name, self.set_volume(volume))
            }
            Command::Status { reply } => respond(reply, name, Ok(self.status())),
            Command::Shutdown => {}
        }
    }

    fn load(&mut self, path: PathBuf, cancel: CancellationToken) -> Result<(), PlayerError> {
        if cancel.is_cancelled() {
            return Err(PlayerError::Superseded(path));
        }
        if self.session.take().is_some() {
            info!("replacing loaded session");
        }
        self.state = PlayerState::Loading;

        match Session::open(
            &path,
            &self.config,
            self.open_output,
            self.ends_tx.clone(),
            self.volume,
        ) {
            Ok(session) => {
                self.session = Some(session);
                self.state = PlayerState::Ready;
                self.events
                    .emit(PlaybackEvent::Loaded, format!("loaded {}", path.display()));
                Ok(())
            }
            Err(err) => {
                self.fail(err.to_string());
                Err(err)
            }
        }
    }

    fn play(&mut self) -> Result<(), PlayerError> {
        if self.state == PlayerState::Playing {
            return Ok(());
        }
        let volume = self.volume;
        let timeout = self.config.start_timeout();
        let session = self.loaded()?;
        let result = session.play(volume, timeout);
        let position_ms = session.position().as_millis();
        let path = session.path().display().to_string();

        match result {
            Ok(()) => {
                self.state = PlayerState::Playing;
                self.reset_watchdog();
                self.events.emit(
                    PlaybackEvent::Playing,
                    format!("playing {path} from {position_ms} ms"),
                );
                Ok(())
            }
            Err(err) => {
                self.fail(err.to_string());
                Err(err)
            }
        }
    }

    fn pause(&mut self) -> Result<(), PlayerError> {
        let playing = self.state == PlayerState::Playing;
        let session = self.loaded()?;
        if playing {
            session.pause();
            self.state = PlayerState::Ready;
        }
        Ok(())
    }

    fn seek(&mut self, offset_ms: i64) -> Result<(), PlayerError> {
        let paused = self.state != PlayerState::Playing;
        let volume = self.volume;
        let session = self.loaded()?;

        let duration_ms = session.duration_ms();
        let in_range = offset_ms >= 0
            && duration_ms.map_or(true, |d| offset_ms.unsigned_abs() <= d);
        if !in_range {
            warn!(offset_ms, ?duration_ms, "seek out of range");
            return Err(PlayerError::InvalidPosition {
                offset_ms,
                duration_ms,
            });
        }

        let target = Duration::from_millis(offset_ms.unsigned_abs());
        match session.cue(target, paused, volume) {
            Ok(()) => {
                self.reset_watchdog();
                Ok(())
            }
            Err(err @ PlayerError::InvalidPosition { .. }) => Err(err),
            Err(err) => {
                self.fail(err.to_string());
                Err(err)
            }
        }
    }

    fn stop(&mut self) -> Result<(), PlayerError> {
        let volume = self.volume;
        let session = self.loaded()?;
        match session.cue(Duration::ZERO, true, volume) {
            Ok(()) => {
                self.state = PlayerState::Ready;
                Ok(())
            }
            Err(err) => {
                self.fail(err.to_string());
                Err(err)
            }
        }
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), PlayerError> {
        if volume.is_nan() {
            return Err(PlayerError::InvalidVolume(volume));
        }
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(session) = self.session.as_ref() {
            session.set_volume(self.volume);
        }
        Ok(())
    }

    fn status(&self) -> PlayerStatus {
        let session = self.session.as_ref();
        PlayerStatus {
            state: self.state,
            position: session.map(Session::position).unwrap_or_default(),
            duration: session.and_then(|s| s.info().duration),
            volume: self.volume,
            path: session.map(|s| s.path().to_path_buf()),
            metadata: session.map(|s| s.info().metadata.clone()),
        }
    }

    fn on_stream_end(&mut self, end: StreamEnd) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if end.generation != session.generation() {
            debug!(
                generation = end.generation,
                current = session.generation(),
                "ignoring end of replaced stream"
            );
            return;
        }

        match end.error {
            None => {
                session.rewind_after_end();
                let message = format!("finished {}", session.path().display());
                self.state = PlayerState::Ready;
                self.events.emit(PlaybackEvent::Finished, message);
            }
            Some(reason) => self.fail(format!("stream failed: {reason}")),
        }
    }

    fn check_stall(&mut self) {
        if self.state != PlayerState::Playing {
            return;
        }
        let Some(frames) = self.session.as_ref().map(Session::frames) else {
            return;
        };
        if frames != self.watchdog.frames {
            self.watchdog = Watchdog {
                frames,
                since: Instant::now(),
            };
        } else if self.watchdog.since.elapsed() >= self.config.stall_timeout() {
            self.fail(format!(
                "output stalled: no progress for {} ms",
                self.config.stall_timeout_ms
            ));
        }
    }

    fn reset_watchdog(&mut self) {
        self.watchdog = Watchdog {
            frames: self.session.as_ref().map_or(0, Session::frames),
            since: Instant::now(),
        };
    }

    fn loaded(&mut self) -> Result<&mut Session, PlayerError> {
        if !self.state.has_source() {
            return Err(PlayerError::NoSourceLoaded);
        }
        self.session.as_mut().ok_or(PlayerError::NoSourceLoaded)
    }

    /// Drops the session and enters the error state.
    fn fail(&mut self, message: String) {
        error!(%message, "player failed");
        self.session = None;
        self.state = PlayerState::Error;
        self.events.emit(PlaybackEvent::Error, message);
    }
}

fn respond<T>(reply: Reply<T>, command: &'static str, result: Result<T, PlayerError>) {
    if let Err(err) = &result {
        warn!(command, %err, "command failed");
    }
    if reply.send(result).is_err() {
        debug!(command, "caller dropped completion");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::StreamInfo;
    use crate::events::{self, Notification};
    use crate::output::{open_output, AudioOutput, StalledOutput};
    use crate::test_util::write_wav;
    use std::path::Path;

    fn test_config() -> PlayerConfig {
        PlayerConfig {
            start_timeout_ms: 500,
            ..PlayerConfig::headless()
        }
    }

    fn new_controller(
        config: PlayerConfig,
        open_output: OutputFactory,
    ) -> (Controller, Receiver<Notification>) {
        let (events, notifications) = events::capture();
        let (_commands, controller) = Controller::new(config, open_output, events);
        (controller, notifications)
    }

    fn stalled(_: &PlayerConfig, _: &StreamInfo) -> Result<Box<dyn AudioOutput>, PlayerError> {
        Ok(Box::new(StalledOutput))
    }

    fn call<T>(
        controller: &mut Controller,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, PlayerError> {
        let (reply, mut rx) = oneshot::channel();
        controller.handle(command(reply));
        rx.try_recv().expect("commands reply before handle returns")
    }

    fn load(controller: &mut Controller, path: &Path) -> Result<(), PlayerError> {
        call(controller, |reply| Command::Load {
            path: path.to_path_buf(),
            cancel: CancellationToken::new(),
            reply,
        })
    }

    fn snapshot(controller: &mut Controller) -> PlayerStatus {
        call(controller, |reply| Command::Status { reply }).unwrap()
    }

    fn generation(controller: &Controller) -> u64 {
        controller.session.as_ref().unwrap().generation()
    }

    fn drain(notifications: &Receiver<Notification>) -> Vec<Notification> {
        notifications.try_iter().collect()
    }

    fn tags(notifications: &[Notification]) -> Vec<PlaybackEvent> {
        notifications.iter().map(|n| n.event).collect()
    }

    #[test]
    fn fatal_stream_end_enters_error() {
        let wav = write_wav(8_000, 2, 1_000);
        let (mut controller, notifications) = new_controller(test_config(), open_output);
        load(&mut controller, wav.path()).unwrap();

        controller
            .ends_tx
            .send(StreamEnd {
                generation: generation(&controller),
                error: Some("read failed: corrupt packet".to_string()),
            })
            .unwrap();

        let status = snapshot(&mut controller);
        assert_eq!(status.state, PlayerState::Error);
        assert_eq!(status.path, None);

        let seen = drain(&notifications);
        assert_eq!(tags(&seen), vec![PlaybackEvent::Loaded, PlaybackEvent::Error]);
        assert!(seen[1].message.contains("corrupt packet"), "{}", seen[1].message);

        assert_eq!(
            call(&mut controller, |reply| Command::Play { reply }),
            Err(PlayerError::NoSourceLoaded)
        );
        assert_eq!(
            call(&mut controller, |reply| Command::Seek { offset_ms: 0, reply }),
            Err(PlayerError::NoSourceLoaded)
        );
    }

    #[test]
    fn end_of_replaced_stream_is_ignored() {
        let wav = write_wav(8_000, 2, 1_000);
        let (mut controller, notifications) = new_controller(test_config(), open_output);
        load(&mut controller, wav.path()).unwrap();
        let stale = generation(&controller);

        call(&mut controller, |reply| Command::Seek { offset_ms: 200, reply }).unwrap();
        assert_ne!(generation(&controller), stale);

        controller
            .ends_tx
            .send(StreamEnd {
                generation: stale,
                error: Some("old sink failed".to_string()),
            })
            .unwrap();
        controller
            .ends_tx
            .send(StreamEnd {
                generation: stale,
                error: None,
            })
            .unwrap();

        let status = snapshot(&mut controller);
        assert_eq!(status.state, PlayerState::Ready);
        assert_eq!(status.position, Duration::from_millis(200));
        assert_eq!(tags(&drain(&notifications)), vec![PlaybackEvent::Loaded]);
    }

    #[test]
    fn queued_end_is_applied_before_next_command() {
        let wav = write_wav(8_000, 2, 1_000);
        let (mut controller, notifications) = new_controller(test_config(), open_output);
        load(&mut controller, wav.path()).unwrap();
        call(&mut controller, |reply| Command::Seek { offset_ms: 1_000, reply }).unwrap();

        controller
            .ends_tx
            .send(StreamEnd {
                generation: generation(&controller),
                error: None,
            })
            .unwrap();
        call(&mut controller, |reply| Command::Play { reply }).unwrap();

        assert_eq!(
            tags(&drain(&notifications)),
            vec![
                PlaybackEvent::Loaded,
                PlaybackEvent::Finished,
                PlaybackEvent::Playing
            ]
        );
        let status = snapshot(&mut controller);
        assert_eq!(status.state, PlayerState::Playing);
        assert!(status.position < Duration::from_millis(500));
    }

    #[test]
    fn play_that_never_starts_is_a_device_error() {
        let wav = write_wav(8_000, 2, 1_000);
        let config = PlayerConfig {
            start_timeout_ms: 100,
            ..test_config()
        };
        let (mut controller, notifications) = new_controller(config, stalled);
        load(&mut controller, wav.path()).unwrap();

        let err = call(&mut controller, |reply| Command::Play { reply }).unwrap_err();
        assert!(matches!(err, PlayerError::DeviceError(_)), "{err:?}");

        assert_eq!(snapshot(&mut controller).state, PlayerState::Error);
        assert_eq!(
            tags(&drain(&notifications)),
            vec![PlaybackEvent::Loaded, PlaybackEvent::Error]
        );
    }

    #[test]
    fn stalled_stream_enters_error() {
        let wav = write_wav(8_000, 2, 5_000);
        let config = PlayerConfig {
            stall_timeout_ms: 100,
            ..test_config()
        };
        let (mut controller, notifications) = new_controller(config, open_output);
        load(&mut controller, wav.path()).unwrap();
        call(&mut controller, |reply| Command::Play { reply }).unwrap();

        // Output stops pulling while the controller still believes it plays.
        controller.session.as_mut().unwrap().pause();

        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.state == PlayerState::Playing && Instant::now() < deadline {
            controller.check_stall();
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(controller.state, PlayerState::Error);
        let seen = drain(&notifications);
        let last = seen.last().unwrap();
        assert_eq!(last.event, PlaybackEvent::Error);
        assert!(last.message.contains("stalled"), "{}", last.message);
    }

    #[test]
    fn cancelled_load_keeps_current_session() {
        let current = write_wav(8_000, 2, 1_000);
        let next = write_wav(8_000, 2, 2_000);
        let (mut controller, notifications) = new_controller(test_config(), open_output);
        load(&mut controller, current.path()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = call(&mut controller, |reply| Command::Load {
            path: next.path().to_path_buf(),
            cancel,
            reply,
        });
        assert_eq!(result, Err(PlayerError::Superseded(next.path().to_path_buf())));

        let status = snapshot(&mut controller);
        assert_eq!(status.state, PlayerState::Ready);
        assert_eq!(status.path.as_deref(), Some(current.path()));
        assert_eq!(tags(&drain(&notifications)), vec![PlaybackEvent::Loaded]);
    }
}
