//! One client/server pairing for one language identifier.
//!
//! A [`Session`] owns the server process, the router holding its pending
//! requests, and the lifecycle state machine in [`state`]. Two background
//! threads serve each session: a reader that feeds framed messages from the
//! server's stdout to the router, and an exit watcher that turns an
//! unexpected process exit into a crash. Both hold only weak references, so
//! dropping the last [`Session`] handle tears the server down.

mod state;

use std::fmt;
use std::io::{BufReader, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use lsp_types::notification::{Exit, Initialized, Notification as LspNotification};
use lsp_types::request::{Initialize, Request as LspRequest, Shutdown};
use lsp_types::{InitializeResult, InitializedParams};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capability::NegotiatedCapabilities;
use crate::config::{InitializeOptions, SessionConfig};
use crate::errors::SessionError;
use crate::jsonrpc::{Message, Notification};
use crate::language::LanguageId;
use crate::router::{PendingResponse, Router, SubscriptionId};
use crate::status::StatusReporter;
use crate::supervisor::{ExitEvent, ExitEvents, LaunchedServer, ServerLauncher, ServerProcess};
use crate::transport::{FramingError, MessageReader, TRANSPORT_TARGET};

pub use state::{SessionEvent, SessionState};

/// Log target for session lifecycle events.
pub(crate) const SESSION_TARGET: &str = "kidl_lsp_client::session";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Cloneable handle on a session.
///
/// Clones share the same server; compare with [`Session::ptr_eq`].
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

struct SessionShared {
    id: SessionId,
    language: LanguageId,
    config: SessionConfig,
    reporter: Arc<dyn StatusReporter>,
    router: Arc<Router>,
    state: Mutex<SessionState>,
    process: Mutex<Option<Arc<dyn ServerProcess>>>,
    pid: Mutex<Option<u32>>,
    capabilities: Mutex<Option<NegotiatedCapabilities>>,
    last_error: Mutex<Option<SessionError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Creates an `Uninitialized` session.
    #[must_use]
    pub fn new(
        language: LanguageId,
        config: SessionConfig,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                id: SessionId::next(),
                language,
                config,
                reporter,
                router: Arc::new(Router::new()),
                state: Mutex::new(SessionState::Uninitialized),
                process: Mutex::new(None),
                pid: Mutex::new(None),
                capabilities: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Language served by the session.
    #[must_use]
    pub fn language(&self) -> &LanguageId {
        &self.shared.language
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// Capabilities recorded by a successful handshake.
    #[must_use]
    pub fn capabilities(&self) -> Option<NegotiatedCapabilities> {
        lock(&self.shared.capabilities).clone()
    }

    /// Error that moved the session to `Crashed`.
    #[must_use]
    pub fn last_error(&self) -> Option<SessionError> {
        lock(&self.shared.last_error).clone()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.router.pending_count()
    }

    /// Operating system id of the server process, once launched.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        *lock(&self.shared.pid)
    }

    #[cfg(test)]
    pub(crate) fn router(&self) -> &Arc<Router> {
        &self.shared.router
    }

    /// Whether both handles refer to the same session.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Launches the server and starts the reader and exit-watch threads.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Spawn`] when the server cannot be launched
    /// (the session is then `Crashed`), or [`SessionError::InvalidState`]
    /// when the session was already started.
    pub fn start(&self, launcher: &dyn ServerLauncher) -> Result<(), SessionError> {
        let shared = &self.shared;
        if shared.transition(SessionEvent::Start).is_none() {
            return Err(shared.invalid_state(SessionState::Uninitialized));
        }
        shared.reporter.session_starting(&shared.language, shared.id);

        let LaunchedServer { io, process } = match launcher.launch(&shared.language) {
            Ok(launched) => launched,
            Err(spawn_error) => {
                let error = SessionError::from(spawn_error);
                shared.fail(SessionEvent::SpawnFailed, error.clone());
                return Err(error);
            }
        };
        let process: Arc<dyn ServerProcess> = Arc::from(process);
        let exit_events = process.watch();

        {
            let state = lock(&shared.state);
            if *state != SessionState::Starting {
                drop(state);
                process.terminate(Duration::ZERO);
                return Err(shared.invalid_state(SessionState::Starting));
            }
            shared.router.attach_writer(io.writer);
            *lock(&shared.pid) = process.id();
            *lock(&shared.process) = Some(process);
        }

        debug!(
            target: SESSION_TARGET,
            language = %shared.language,
            session = %shared.id,
            pid = ?self.pid(),
            "language server launched"
        );

        let weak = Arc::downgrade(&self.shared);
        if let Err(error) = spawn_named(format!("kidl-reader-{}", shared.id), {
            let session = Weak::clone(&weak);
            move || read_loop(&session, io.reader)
        }) {
            let failure = SessionError::crashed(format!("failed to start reader thread: {error}"));
            shared.fail(SessionEvent::TransportFailed, failure.clone());
            return Err(failure);
        }
        if let Err(error) = spawn_named(format!("kidl-watch-{}", shared.id), move || {
            watch_exit(&weak, exit_events);
        }) {
            warn!(target: SESSION_TARGET, session = %shared.id, %error, "failed to start exit watcher");
        }
        Ok(())
    }

    /// Performs the `initialize` handshake and moves the session to `Running`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Timeout`] when the server does not answer
    /// within the initialise timeout, or the error that crashed the session.
    /// Any failure leaves the session `Crashed`.
    pub fn initialize(
        &self,
        options: &InitializeOptions,
    ) -> Result<NegotiatedCapabilities, SessionError> {
        let shared = &self.shared;
        if self.state() != SessionState::Starting {
            return Err(shared.unavailable(SessionState::Starting));
        }

        let params = serde_json::to_value(options.to_params()).map_err(SessionError::protocol)?;
        let pending = match shared.router.send_request(Initialize::METHOD, Some(params)) {
            Ok(pending) => pending,
            Err(error) => {
                shared.fail(SessionEvent::TransportFailed, error.clone());
                return Err(shared.crash_cause(error));
            }
        };
        if shared.transition(SessionEvent::InitializeSent).is_none() {
            return Err(shared.unavailable(SessionState::Starting));
        }

        let outcome = pending
            .wait(shared.config.initialize_timeout)
            .and_then(|value| {
                serde_json::from_value::<InitializeResult>(value).map_err(|error| {
                    SessionError::protocol(format!("malformed initialize result: {error}"))
                })
            });
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                shared.fail(SessionEvent::InitializeFailed, error.clone());
                return Err(shared.crash_cause(error));
            }
        };

        let capabilities = NegotiatedCapabilities::new(result);
        *lock(&shared.capabilities) = Some(capabilities.clone());

        let initialized = serde_json::to_value(InitializedParams {}).map_err(SessionError::protocol)?;
        if let Err(error) = shared
            .router
            .send_notification(Initialized::METHOD, Some(initialized))
        {
            shared.fail(SessionEvent::TransportFailed, error.clone());
            return Err(shared.crash_cause(error));
        }
        if shared
            .transition(SessionEvent::InitializeSucceeded)
            .is_none()
        {
            return Err(shared.unavailable(SessionState::Initializing));
        }

        shared
            .reporter
            .session_running(&shared.language, shared.id, &capabilities);
        Ok(capabilities)
    }

    /// Sends a request without waiting for its response.
    ///
    /// # Errors
    ///
    /// Fails when the session is not `Running` or the transport is broken;
    /// a broken transport also crashes the session.
    pub fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingResponse, SessionError> {
        self.shared.require_running()?;
        self.shared
            .router
            .send_request(method, params)
            .map_err(|error| self.shared.escalate(error))
    }

    /// Sends a request and waits up to the request timeout for the result.
    ///
    /// # Errors
    ///
    /// Returns the error the request resolved with; a timeout leaves the
    /// session `Running`.
    pub fn request(&self, method: &str, params: Option<Value>) -> Result<Value, SessionError> {
        self.send_request(method, params)?
            .wait(self.shared.config.request_timeout)
    }

    /// Typed request over an `lsp_types` request definition.
    ///
    /// # Errors
    ///
    /// As [`Session::request`], plus [`SessionError::ProtocolViolation`] when
    /// the result does not match `R::Result`.
    pub fn call<R>(&self, params: R::Params) -> Result<R::Result, SessionError>
    where
        R: LspRequest,
        R::Params: Serialize,
        R::Result: DeserializeOwned,
    {
        let value = self.request(R::METHOD, Some(to_params(params)?))?;
        serde_json::from_value(value).map_err(|error| {
            SessionError::protocol(format!("malformed '{}' result: {error}", R::METHOD))
        })
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Fails when the session is not `Running` or the transport is broken.
    pub fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        self.shared.require_running()?;
        self.shared
            .router
            .send_notification(method, params)
            .map_err(|error| self.shared.escalate(error))
    }

    /// Typed notification over an `lsp_types` notification definition.
    ///
    /// # Errors
    ///
    /// As [`Session::send_notification`].
    pub fn notify<N>(&self, params: N::Params) -> Result<(), SessionError>
    where
        N: LspNotification,
        N::Params: Serialize,
    {
        self.send_notification(N::METHOD, Some(to_params(params)?))
    }

    /// Registers a handler for server notifications of `method`.
    pub fn subscribe<F>(&self, method: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared.router.subscribe(method, Arc::new(handler))
    }

    /// Removes a notification handler.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.shared.router.unsubscribe(subscription)
    }

    /// Shuts the session down gracefully.
    ///
    /// Pending requests resolve with `Cancelled` first. A `Running` server
    /// then receives `shutdown` and `exit` before the process is terminated
    /// with the grace timeout. Calling this on a session that is already
    /// shutting down or terminal has no effect.
    pub fn shutdown(&self) -> Option<ExitEvent> {
        let shared = &self.shared;
        let Some((from, to)) = shared.transition(SessionEvent::DeactivateRequested) else {
            return None;
        };
        if to == SessionState::Stopped {
            shared.reporter.session_stopped(&shared.language, shared.id);
            return None;
        }

        let cancelled = shared.cancel_pending();
        if from == SessionState::Running {
            shared.request_shutdown();
        }
        shared.router.detach_writer();
        let exit = shared
            .process()
            .and_then(|process| process.terminate(shared.config.grace_timeout));
        shared.finish_stop(cancelled, exit);
        exit
    }

    /// Kills the server immediately and marks the session `Stopped`.
    ///
    /// Used when a graceful shutdown overruns its deadline; safe to call
    /// while [`Session::shutdown`] is in progress on another thread.
    pub fn force_terminate(&self) -> Option<ExitEvent> {
        let shared = &self.shared;
        match shared.transition(SessionEvent::DeactivateRequested) {
            Some((_, SessionState::Stopped)) => {
                shared.reporter.session_stopped(&shared.language, shared.id);
                return None;
            }
            Some(_) => {}
            None if self.state() == SessionState::ShuttingDown => {}
            None => return None,
        }
        let cancelled = shared.cancel_pending();
        let exit = shared
            .process()
            .and_then(|process| process.terminate(Duration::ZERO));
        shared.router.detach_writer();
        shared.finish_stop(cancelled, exit);
        exit
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Session")
            .field("id", &self.id())
            .field("language", self.language())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionShared {
    /// Applies `event` to the state machine, returning `(from, to)` when it
    /// changed the state.
    fn transition(&self, event: SessionEvent) -> Option<(SessionState, SessionState)> {
        let mut state = lock(&self.state);
        let from = *state;
        let to = from.on(event)?;
        *state = to;
        drop(state);

        debug!(
            target: SESSION_TARGET,
            language = %self.language,
            session = %self.id,
            ?event,
            %from,
            %to,
            "session state changed"
        );
        Some((from, to))
    }

    /// Moves the session to `Crashed` and releases its resources.
    ///
    /// Returns `false` when `event` does not crash the session in its
    /// current state; the session is then left untouched.
    fn fail(&self, event: SessionEvent, error: SessionError) -> bool {
        if self.transition(event).is_none() {
            return false;
        }
        let recorded = lock(&self.last_error).insert(error).clone();

        let failed = self.router.fail_all(|_| recorded.clone());
        if let Some(process) = lock(&self.process).take() {
            process.terminate(Duration::ZERO);
        }
        self.router.detach_writer();

        warn!(
            target: SESSION_TARGET,
            language = %self.language,
            session = %self.id,
            ?event,
            failed_requests = failed,
            error = %recorded,
            "session crashed"
        );
        self.reporter
            .session_crashed(&self.language, self.id, &recorded);
        true
    }

    /// Crashes the session for a transport failure and returns the error.
    fn escalate(&self, error: SessionError) -> SessionError {
        self.fail(SessionEvent::TransportFailed, error.clone());
        self.crash_cause(error)
    }

    /// Prefers the error that crashed the session over `fallback`.
    fn crash_cause(&self, fallback: SessionError) -> SessionError {
        lock(&self.last_error).clone().unwrap_or(fallback)
    }

    fn require_running(&self) -> Result<(), SessionError> {
        if *lock(&self.state) == SessionState::Running {
            return Ok(());
        }
        Err(self.unavailable(SessionState::Running))
    }

    /// Error for an operation attempted in the wrong state: the crash cause
    /// for crashed sessions, otherwise [`SessionError::InvalidState`].
    fn unavailable(&self, expected: SessionState) -> SessionError {
        let recorded = lock(&self.last_error).clone();
        recorded.unwrap_or_else(|| self.invalid_state(expected))
    }

    fn invalid_state(&self, expected: SessionState) -> SessionError {
        SessionError::InvalidState {
            language: self.language.clone(),
            state: *lock(&self.state),
            expected,
        }
    }

    fn process(&self) -> Option<Arc<dyn ServerProcess>> {
        lock(&self.process).clone()
    }

    fn cancel_pending(&self) -> usize {
        self.router
            .fail_all(|id| SessionError::Cancelled { id: id.clone() })
    }

    fn request_shutdown(&self) {
        match self.router.send_request(Shutdown::METHOD, None) {
            Ok(pending) => {
                if let Err(error) = pending.wait(self.config.shutdown_timeout) {
                    debug!(target: SESSION_TARGET, session = %self.id, %error, "shutdown request failed");
                }
            }
            Err(error) => {
                debug!(target: SESSION_TARGET, session = %self.id, %error, "shutdown request not sent");
            }
        }
        if let Err(error) = self.router.send_notification(Exit::METHOD, None) {
            debug!(target: SESSION_TARGET, session = %self.id, %error, "exit notification not sent");
        }
    }

    /// Marks the session `Stopped`. Requests registered after the first
    /// drain, by callers that passed the `Running` check just before
    /// teardown began, are cancelled here.
    fn finish_stop(&self, cancelled: usize, exit: Option<ExitEvent>) {
        lock(&self.process).take();
        let cancelled_total = cancelled + self.cancel_pending();
        if self.transition(SessionEvent::Terminated).is_none() {
            return;
        }
        info!(
            target: SESSION_TARGET,
            language = %self.language,
            session = %self.id,
            cancelled_requests = cancelled_total,
            exit = ?exit,
            "session stopped"
        );
        self.reporter.session_stopped(&self.language, self.id);
    }

    fn dispatch(&self, message: Message) {
        if let Err(error) = self.router.on_message(message) {
            warn!(
                target: SESSION_TARGET,
                language = %self.language,
                session = %self.id,
                %error,
                "dropping unmatched response"
            );
        }
    }

    fn on_framing_error(&self, error: &FramingError) {
        if let FramingError::InvalidPayload { raw, .. } = error {
            warn!(
                target: TRANSPORT_TARGET,
                session = %self.id,
                raw = %String::from_utf8_lossy(raw),
                "discarding malformed payload"
            );
        }
        self.fail(SessionEvent::TransportFailed, SessionError::protocol(error));
    }

    fn on_stream_closed(&self) {
        self.fail(
            SessionEvent::TransportFailed,
            SessionError::crashed("language server closed its output stream"),
        );
    }

    fn on_exit(&self, event: ExitEvent) {
        let crashed = self.fail(
            SessionEvent::ProcessExited,
            SessionError::crashed(format!("language server {event}")),
        );
        if !crashed {
            debug!(
                target: SESSION_TARGET,
                session = %self.id,
                %event,
                state = %*lock(&self.state),
                "language server exit observed"
            );
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        let released = self
            .router
            .fail_all(|_| SessionError::crashed("session was released"));
        if let Some(process) = lock(&self.process).take() {
            process.terminate(Duration::ZERO);
        }
        self.router.detach_writer();
        if released > 0 {
            debug!(target: SESSION_TARGET, session = %self.id, released, "released pending requests");
        }
    }
}

fn to_params<P: Serialize>(params: P) -> Result<Value, SessionError> {
    serde_json::to_value(params).map_err(SessionError::protocol)
}

fn spawn_named<F>(name: String, body: F) -> std::io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name).spawn(body).map(|_| ())
}

fn read_loop(session: &Weak<SessionShared>, reader: Box<dyn Read + Send>) {
    for item in MessageReader::new(BufReader::new(reader)) {
        let Some(shared) = session.upgrade() else {
            return;
        };
        match item {
            Ok(message) => shared.dispatch(message),
            Err(error) => {
                shared.on_framing_error(&error);
                return;
            }
        }
    }
    if let Some(shared) = session.upgrade() {
        shared.on_stream_closed();
    }
}

fn watch_exit(session: &Weak<SessionShared>, mut events: ExitEvents) {
    let Some(event) = events.next() else {
        return;
    };
    if let Some(shared) = session.upgrade() {
        shared.on_exit(event);
    }
}
