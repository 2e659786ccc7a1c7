use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Player event tags.
///
/// The ordinals are a stable contract for callers that pass events across a
/// language boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PlaybackEvent {
    /// A source was opened and is ready to play
    Loaded = 0,
    /// Output actually started pulling samples
    Playing = 1,
    /// The stream reached its end
    Finished = 2,
    /// Decode, device or load failure
    Error = 3,
}

impl PlaybackEvent {
    /// Tag name, as passed to callers across a language boundary.
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackEvent::Loaded => "Loaded",
            PlaybackEvent::Playing => "Playing",
            PlaybackEvent::Finished => "Finished",
            PlaybackEvent::Error => "Error",
        }
    }
}

impl fmt::Display for PlaybackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<PlaybackEvent> for u8 {
    fn from(event: PlaybackEvent) -> Self {
        event as u8
    }
}

impl TryFrom<u8> for PlaybackEvent {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(PlaybackEvent::Loaded),
            1 => Ok(PlaybackEvent::Playing),
            2 => Ok(PlaybackEvent::Finished),
            3 => Ok(PlaybackEvent::Error),
            other => Err(other),
        }
    }
}

/// Subscriber invoked with each event and its message.
pub type EventCallback = Box<dyn Fn(PlaybackEvent, &str) + Send + 'static>;

/// Single-slot subscriber. Setting replaces, never accumulates.
#[derive(Clone, Default)]
pub(crate) struct CallbackSlot {
    inner: Arc<Mutex<Option<EventCallback>>>,
}

impl CallbackSlot {
    pub(crate) fn replace(&self, callback: Option<EventCallback>) {
        *self.inner.lock() = callback;
    }

    /// Invokes the current subscriber with the slot locked, so a concurrent
    /// `replace` waits for the running callback to return.
    fn deliver(&self, event: PlaybackEvent, message: &str) {
        if let Some(ref cb) = *self.inner.lock() {
            cb(event, message);
        } else {
            trace!(%event, "no subscriber");
        }
    }
}

/// One event on its way to the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Notification {
    pub event: PlaybackEvent,
    pub message: String,
}

/// Sending half held by the control thread.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: Sender<Notification>,
}

impl EventSender {
    pub(crate) fn emit(&self, event: PlaybackEvent, message: impl Into<String>) {
        let message = message.into();
        debug!(%event, %message, "emit");
        // The dispatcher only goes away during shutdown.
        let _ = self.tx.send(Notification { event, message });
    }
}

/// Starts the thread that feeds notifications to the subscriber slot. The
/// thread exits once every [`EventSender`] has been dropped.
pub(crate) fn spawn_dispatcher(
    slot: CallbackSlot,
) -> std::io::Result<(EventSender, JoinHandle<()>)> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = thread::Builder::new()
        .name("audio-events".to_string())
        .spawn(move || dispatch_loop(rx, slot))?;
    Ok((EventSender { tx }, handle))
}

/// An [`EventSender`] whose notifications are read back directly, without a
/// dispatch thread.
#[cfg(test)]
pub(crate) fn capture() -> (EventSender, Receiver<Notification>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EventSender { tx }, rx)
}

fn dispatch_loop(rx: Receiver<Notification>, slot: CallbackSlot) {
    for notification in rx {
        slot.deliver(notification.event, &notification.message);
    }
    debug!("event dispatcher stopped");
}
