//! Registry owning at most one live session per language identifier.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use lsp_types::notification::{DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument};
use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    TextDocumentItem,
};
use tracing::{debug, info, warn};

use crate::config::{InitializeOptions, SessionConfig};
use crate::errors::SessionError;
use crate::language::{DocumentSelector, LanguageId};
use crate::session::{Session, SessionState};
use crate::status::{StatusReporter, TracingStatusReporter};
use crate::supervisor::ServerLauncher;

/// Log target for registrar events.
pub(crate) const REGISTRAR_TARGET: &str = "kidl_lsp_client::registrar";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One language's session and the gate held while its handshake runs.
///
/// The lock is never held across `start` or `initialize`, so deactivation
/// can reach a session that is still starting.
#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    handshake_done: Condvar,
}

#[derive(Default)]
struct SlotState {
    session: Option<Session>,
    starting: bool,
    /// Set once the slot has left the registry; resolvers must look again.
    retired: bool,
}

impl Slot {
    fn current(&self) -> Option<Session> {
        lock(&self.state).session.clone()
    }

    fn take(&self) -> Option<Session> {
        lock(&self.state).session.take()
    }

    fn finish_handshake(&self) {
        lock(&self.state).starting = false;
        self.handshake_done.notify_all();
    }

    fn retire(&self) -> Option<Session> {
        let mut state = lock(&self.state);
        state.retired = true;
        let session = state.session.take();
        drop(state);
        self.handshake_done.notify_all();
        session
    }
}

/// Languages whose sessions stopped gracefully or had to be killed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeactivationReport {
    /// Sessions that completed `shutdown` before the deadline.
    pub stopped: Vec<LanguageId>,
    /// Sessions force-terminated after the deadline.
    pub forced: Vec<LanguageId>,
}

impl DeactivationReport {
    /// Whether every session stopped gracefully.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

/// Maps language identifiers to sessions, creating them on first use.
///
/// Each identifier has its own slot: concurrent callers resolving the same
/// language wait for a single handshake, while different languages start
/// independently.
pub struct SessionRegistrar {
    selector: DocumentSelector,
    launcher: Arc<dyn ServerLauncher>,
    config: SessionConfig,
    options: InitializeOptions,
    reporter: Arc<dyn StatusReporter>,
    slots: Mutex<HashMap<LanguageId, Arc<Slot>>>,
}

impl SessionRegistrar {
    /// Creates a registrar with default timeouts and a tracing reporter.
    #[must_use]
    pub fn new(selector: DocumentSelector, launcher: Arc<dyn ServerLauncher>) -> Self {
        Self {
            selector,
            launcher,
            config: SessionConfig::default(),
            options: InitializeOptions::default(),
            reporter: Arc::new(TracingStatusReporter::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the timeouts applied to new sessions.
    #[must_use]
    pub const fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the `initialize` options sent by new sessions.
    #[must_use]
    pub fn with_initialize_options(mut self, options: InitializeOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the lifecycle observer.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Languages this registrar serves.
    #[must_use]
    pub const fn selector(&self) -> &DocumentSelector {
        &self.selector
    }

    /// Returns the live session for `language`, starting one if needed.
    ///
    /// A `Crashed` or `Stopped` session is replaced by a fresh one, except
    /// when the crash was a launch failure: that error is returned until
    /// [`SessionRegistrar::restart`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnsupportedLanguage`] for languages outside
    /// the selector, or the error that stopped the new session reaching
    /// `Running`.
    pub fn resolve_session(&self, language: &LanguageId) -> Result<Session, SessionError> {
        self.ensure_selected(language)?;
        loop {
            let slot = self.slot(language);
            let mut current = slot
                .handshake_done
                .wait_while(lock(&slot.state), |state| state.starting && !state.retired)
                .unwrap_or_else(PoisonError::into_inner);
            if current.retired {
                continue;
            }

            if let Some(existing) = current.session.as_ref() {
                match existing.state() {
                    SessionState::Crashed => {
                        if let Some(error @ SessionError::Spawn(_)) = existing.last_error() {
                            return Err(error);
                        }
                    }
                    SessionState::Stopped => {}
                    _ => return Ok(existing.clone()),
                }
            }

            let session = Session::new(language.clone(), self.config, Arc::clone(&self.reporter));
            current.session = Some(session.clone());
            current.starting = true;
            drop(current);
            info!(
                target: REGISTRAR_TARGET,
                %language,
                session = %session.id(),
                "creating session"
            );
            let handshake = session
                .start(self.launcher.as_ref())
                .and_then(|()| session.initialize(&self.options));
            slot.finish_handshake();
            return handshake.map(|_| session);
        }
    }

    /// The current session for `language`, in whatever state it is in.
    #[must_use]
    pub fn session(&self, language: &LanguageId) -> Option<Session> {
        let slot = lock(&self.slots).get(language).cloned()?;
        slot.current()
    }

    /// Every session currently held, ordered by language.
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        let slots: Vec<Arc<Slot>> = lock(&self.slots).values().cloned().collect();
        let mut sessions: Vec<Session> = slots.iter().filter_map(|slot| slot.current()).collect();
        sessions.sort_by(|left, right| left.language().cmp(right.language()));
        sessions
    }

    /// Shuts down the current session for `language` and starts a new one.
    ///
    /// Clears a remembered launch failure.
    ///
    /// # Errors
    ///
    /// As [`SessionRegistrar::resolve_session`].
    pub fn restart(&self, language: &LanguageId) -> Result<Session, SessionError> {
        self.ensure_selected(language)?;
        let previous = self.slot(language).take();
        if let Some(session) = previous {
            info!(
                target: REGISTRAR_TARGET,
                %language,
                session = %session.id(),
                state = %session.state(),
                "restarting session"
            );
            session.shutdown();
        }
        self.resolve_session(language)
    }

    /// Routes `textDocument/didOpen`, starting the session when needed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnsupportedLanguage`] when the document's
    /// language is not served, or any error from resolving the session.
    pub fn open_document(&self, document: TextDocumentItem) -> Result<Session, SessionError> {
        let language = self.language_of(&document.language_id)?;
        let session = self.resolve_session(&language)?;
        session.notify::<DidOpenTextDocument>(DidOpenTextDocumentParams {
            text_document: document,
        })?;
        Ok(session)
    }

    /// Routes `textDocument/didChange` to a running session.
    ///
    /// Returns `false` when no session for `language` is running.
    ///
    /// # Errors
    ///
    /// Returns the error raised while sending the notification.
    pub fn change_document(
        &self,
        language: &LanguageId,
        params: DidChangeTextDocumentParams,
    ) -> Result<bool, SessionError> {
        let Some(session) = self.running_session(language) else {
            debug!(target: REGISTRAR_TARGET, %language, "no running session for didChange");
            return Ok(false);
        };
        session.notify::<DidChangeTextDocument>(params)?;
        Ok(true)
    }

    /// Routes `textDocument/didClose` to a running session.
    ///
    /// Returns `false` when no session for `language` is running.
    ///
    /// # Errors
    ///
    /// Returns the error raised while sending the notification.
    pub fn close_document(
        &self,
        language: &LanguageId,
        params: DidCloseTextDocumentParams,
    ) -> Result<bool, SessionError> {
        let Some(session) = self.running_session(language) else {
            debug!(target: REGISTRAR_TARGET, %language, "no running session for didClose");
            return Ok(false);
        };
        session.notify::<DidCloseTextDocument>(params)?;
        Ok(true)
    }

    /// Shuts every live session down in parallel.
    ///
    /// Sessions still shutting down when `timeout` elapses are killed. The
    /// registrar is empty afterwards. A session still in its handshake is
    /// shut down like any other; its resolver sees `Cancelled`.
    pub fn deactivate_all(&self, timeout: Duration) -> DeactivationReport {
        let deadline = Instant::now() + timeout;
        let slots: Vec<Arc<Slot>> = lock(&self.slots).drain().map(|(_, slot)| slot).collect();
        let sessions: Vec<Session> = slots
            .iter()
            .filter_map(|slot| slot.retire())
            .filter(|session| !session.state().is_terminal())
            .collect();

        let (sender, receiver) = mpsc::channel();
        for session in &sessions {
            let worker = session.clone();
            let done = sender.clone();
            let spawned = thread::Builder::new()
                .name(format!("kidl-shutdown-{}", session.id()))
                .spawn(move || {
                    worker.shutdown();
                    if done.send(worker.id()).is_err() {
                        debug!(target: REGISTRAR_TARGET, session = %worker.id(), "deactivation already finished");
                    }
                });
            if let Err(error) = spawned {
                warn!(target: REGISTRAR_TARGET, session = %session.id(), %error, "failed to start shutdown worker");
            }
        }
        drop(sender);

        let mut finished = HashSet::new();
        while finished.len() < sessions.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(remaining) {
                Ok(id) => {
                    finished.insert(id);
                }
                Err(_) => break,
            }
        }

        let mut report = DeactivationReport::default();
        for session in sessions {
            let language = session.language().clone();
            if finished.contains(&session.id()) {
                report.stopped.push(language);
            } else {
                warn!(
                    target: REGISTRAR_TARGET,
                    %language,
                    session = %session.id(),
                    "session did not stop before the deadline, forcing termination"
                );
                session.force_terminate();
                report.forced.push(language);
            }
        }
        report.stopped.sort();
        report.forced.sort();
        info!(
            target: REGISTRAR_TARGET,
            stopped = report.stopped.len(),
            forced = report.forced.len(),
            "sessions deactivated"
        );
        report
    }

    fn ensure_selected(&self, language: &LanguageId) -> Result<(), SessionError> {
        if self.selector.matches(language) {
            return Ok(());
        }
        Err(SessionError::UnsupportedLanguage {
            language: language.to_string(),
        })
    }

    fn language_of(&self, raw: &str) -> Result<LanguageId, SessionError> {
        LanguageId::new(raw)
            .ok()
            .filter(|language| self.selector.matches(language))
            .ok_or_else(|| SessionError::UnsupportedLanguage {
                language: raw.to_owned(),
            })
    }

    fn running_session(&self, language: &LanguageId) -> Option<Session> {
        self.session(language)
            .filter(|session| session.state() == SessionState::Running)
    }

    fn slot(&self, language: &LanguageId) -> Arc<Slot> {
        let mut slots = lock(&self.slots);
        Arc::clone(slots.entry(language.clone()).or_default())
    }
}
