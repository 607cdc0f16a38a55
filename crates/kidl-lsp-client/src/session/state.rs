//! Session lifecycle states and the transition table.

use std::fmt;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created; no process launched yet.
    Uninitialized,
    /// Launching the server process.
    Starting,
    /// `initialize` sent; awaiting the server's capabilities.
    Initializing,
    /// Handshake complete; requests may be sent.
    Running,
    /// Graceful teardown in progress.
    ShuttingDown,
    /// Torn down on request. Terminal.
    Stopped,
    /// Torn down by a failure. Terminal.
    Crashed,
}

/// Inputs that drive [`SessionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server is being launched.
    Start,
    /// The transport is live and `initialize` was written.
    InitializeSent,
    /// The server process could not be launched.
    SpawnFailed,
    /// The server answered `initialize` successfully.
    InitializeSucceeded,
    /// The handshake failed or timed out.
    InitializeFailed,
    /// The server process exited.
    ProcessExited,
    /// The transport closed or carried malformed data.
    TransportFailed,
    /// The session was asked to shut down.
    DeactivateRequested,
    /// Teardown completed.
    Terminated,
}

impl SessionState {
    /// Applies `event`, returning the next state, or `None` when the event
    /// has no effect in this state.
    #[must_use]
    pub const fn on(self, event: SessionEvent) -> Option<Self> {
        use SessionEvent as E;

        match (self, event) {
            (Self::Uninitialized, E::Start) => Some(Self::Starting),
            (Self::Uninitialized, E::DeactivateRequested) => Some(Self::Stopped),
            (Self::Starting, E::InitializeSent) => Some(Self::Initializing),
            (Self::Initializing, E::InitializeSucceeded) => Some(Self::Running),
            (
                Self::Starting,
                E::SpawnFailed | E::InitializeFailed | E::ProcessExited | E::TransportFailed,
            )
            | (Self::Initializing, E::InitializeFailed | E::ProcessExited | E::TransportFailed)
            | (Self::Running, E::ProcessExited | E::TransportFailed) => Some(Self::Crashed),
            (Self::Starting | Self::Initializing | Self::Running, E::DeactivateRequested) => {
                Some(Self::ShuttingDown)
            }
            (Self::ShuttingDown, E::Terminated) => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Whether the state is `Stopped` or `Crashed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    /// Whether a server process may be attached.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Initializing | Self::Running)
    }

    /// Stable lowercase label, used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}
