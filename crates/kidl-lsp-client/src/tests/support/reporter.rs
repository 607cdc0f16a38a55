//! Status reporter that remembers what it was told.

use std::sync::{Mutex, PoisonError};

use crate::capability::NegotiatedCapabilities;
use crate::errors::{SessionError, SessionErrorKind};
use crate::language::LanguageId;
use crate::session::SessionId;
use crate::status::StatusReporter;

/// One lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// `session_starting`.
    Starting(SessionId),
    /// `session_running`.
    Running(SessionId),
    /// `session_crashed` with the error's kind.
    Crashed(SessionId, SessionErrorKind),
    /// `session_stopped`.
    Stopped(SessionId),
}

/// Records every notification in order.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingReporter {
    /// Notifications received so far.
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Notifications concerning `session`.
    pub fn events_for(&self, session: SessionId) -> Vec<StatusEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.session() == session)
            .collect()
    }

    /// Number of crash notifications for `session`.
    pub fn crashes(&self, session: SessionId) -> usize {
        self.events_for(session)
            .iter()
            .filter(|event| matches!(event, StatusEvent::Crashed(..)))
            .count()
    }

    fn push(&self, event: StatusEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl StatusEvent {
    const fn session(&self) -> SessionId {
        match self {
            Self::Starting(id) | Self::Running(id) | Self::Crashed(id, _) | Self::Stopped(id) => *id,
        }
    }
}

impl StatusReporter for RecordingReporter {
    fn session_starting(&self, _language: &LanguageId, session: SessionId) {
        self.push(StatusEvent::Starting(session));
    }

    fn session_running(
        &self,
        _language: &LanguageId,
        session: SessionId,
        _capabilities: &NegotiatedCapabilities,
    ) {
        self.push(StatusEvent::Running(session));
    }

    fn session_crashed(&self, _language: &LanguageId, session: SessionId, error: &SessionError) {
        self.push(StatusEvent::Crashed(session, error.kind()));
    }

    fn session_stopped(&self, _language: &LanguageId, session: SessionId) {
        self.push(StatusEvent::Stopped(session));
    }
}
