//! Process exit events.

use std::fmt;
use std::process::ExitStatus;
use std::sync::mpsc::{self, Receiver, SyncSender};

/// Terminal event of a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitEvent {
    /// The process exited with a status code.
    Exited {
        /// Exit status code.
        code: i32,
    },
    /// The process was terminated by a signal.
    Signalled {
        /// Signal number.
        signal: i32,
    },
    /// The process ended but its status could not be read.
    Unknown,
}

impl ExitEvent {
    /// Translates a reaped exit status.
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited { code };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signalled { signal };
            }
        }
        Self::Unknown
    }

    /// Whether the process exited cleanly with status zero.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }
}

impl fmt::Display for ExitEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(formatter, "exited with code {code}"),
            Self::Signalled { signal } => write!(formatter, "terminated by signal {signal}"),
            Self::Unknown => formatter.write_str("exited with unknown status"),
        }
    }
}

/// Lazy sequence yielding at most one [`ExitEvent`].
///
/// The first call to `next` blocks until the process ends. The sequence is
/// empty when the process handle goes away without observing an exit.
pub struct ExitEvents {
    receiver: Option<Receiver<ExitEvent>>,
}

impl ExitEvents {
    /// Creates a connected sender and sequence.
    #[must_use]
    pub fn channel() -> (ExitNotifier, Self) {
        let (sender, receiver) = mpsc::sync_channel(1);
        (
            ExitNotifier { sender },
            Self {
                receiver: Some(receiver),
            },
        )
    }

    /// A sequence that has already yielded `event`.
    #[must_use]
    pub fn ready(event: ExitEvent) -> Self {
        let (notifier, events) = Self::channel();
        notifier.notify(event);
        events
    }

    /// A sequence that never yields.
    #[must_use]
    pub const fn empty() -> Self {
        Self { receiver: None }
    }
}

impl Iterator for ExitEvents {
    type Item = ExitEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.take()?.recv().ok()
    }
}

impl std::iter::FusedIterator for ExitEvents {}

/// Sending half of an [`ExitEvents`] sequence.
pub struct ExitNotifier {
    sender: SyncSender<ExitEvent>,
}

impl ExitNotifier {
    /// Publishes the exit event. Later calls have no effect.
    pub fn notify(&self, event: ExitEvent) {
        // A full channel already holds the event; a closed one has no reader.
        self.sender.try_send(event).ok();
    }
}
