//! Request/response correlation and notification dispatch for one session.
//!
//! The router owns the pending-request table and the write half of the
//! transport. Requests are registered before their frame is written so a fast
//! response can never race ahead of its table entry. Every entry is removed
//! exactly once, by whichever of response, timeout, cancellation or teardown
//! gets there first, and only that path resolves the caller.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use crate::errors::{SessionError, UnmatchedResponseError};
use crate::jsonrpc::{JsonRpcError, Message, Notification, Request, RequestId, Response};
use crate::transport::MessageWriter;

/// Log target for routing events.
pub(crate) const ROUTER_TARGET: &str = "kidl_lsp_client::router";

/// Method used to ask the server to abandon a request.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

type Outcome = Result<Value, SessionError>;

/// Callback invoked for every notification of a subscribed method.
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

type SharedWriter = MessageWriter<Box<dyn Write + Send>>;

struct PendingEntry {
    method: String,
    submitted_at: Instant,
    completion: SyncSender<Outcome>,
}

/// Identifies a notification subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// What [`Router::on_message`] did with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A pending request was resolved.
    Response {
        /// Identifier of the resolved request.
        id: RequestId,
    },
    /// A notification was handed to its subscribers.
    Notification {
        /// Notification method.
        method: String,
        /// Number of handlers invoked; zero for unknown methods.
        handlers: usize,
    },
    /// A server-initiated request was refused with `MethodNotFound`.
    ServerRequest {
        /// Method the server asked for.
        method: String,
    },
}

/// Correlates requests with responses and fans out notifications.
pub struct Router {
    next_id: AtomicI64,
    next_subscription: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, NotificationHandler)>>>,
    writer: Mutex<Option<SharedWriter>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates a router with no transport attached.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            next_subscription: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            writer: Mutex::new(None),
        }
    }

    /// Installs the write half of the transport.
    pub fn attach_writer(&self, writer: Box<dyn Write + Send>) {
        *self.lock_writer() = Some(MessageWriter::new(writer));
    }

    /// Drops the write half, closing the server's stdin.
    ///
    /// Returns `true` when a writer was attached.
    pub fn detach_writer(&self) -> bool {
        self.lock_writer().take().is_some()
    }

    /// Sends a request and registers it as pending.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Crashed`] when no transport is attached or the
    /// frame cannot be written; the request is not left pending.
    pub fn send_request(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingResponse, SessionError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (completion, receiver) = mpsc::sync_channel(1);

        self.lock_pending().insert(
            id.clone(),
            PendingEntry {
                method: method.to_owned(),
                submitted_at: Instant::now(),
                completion,
            },
        );

        let message = Message::Request(Request {
            id: id.clone(),
            method: method.to_owned(),
            params,
        });
        if let Err(error) = self.write(&message) {
            self.lock_pending().remove(&id);
            return Err(error);
        }

        trace!(target: ROUTER_TARGET, %id, method, "request sent");
        Ok(PendingResponse {
            id,
            method: method.to_owned(),
            receiver,
            router: Arc::downgrade(self),
        })
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Crashed`] when no transport is attached or the
    /// frame cannot be written.
    pub fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        self.write(&Message::notification(method, params))?;
        trace!(target: ROUTER_TARGET, method, "notification sent");
        Ok(())
    }

    /// Sends a response to a server-initiated request.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Crashed`] when the frame cannot be written.
    pub fn respond(&self, response: Response) -> Result<(), SessionError> {
        self.write(&Message::Response(response))
    }

    /// Routes one inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`UnmatchedResponseError`] for a response whose id has no
    /// pending request. Callers log and drop it.
    pub fn on_message(&self, message: Message) -> Result<Dispatched, UnmatchedResponseError> {
        match message {
            Message::Response(response) => self.on_response(response),
            Message::Notification(notification) => Ok(self.on_notification(&notification)),
            Message::Request(request) => Ok(self.on_server_request(request)),
        }
    }

    fn on_response(&self, response: Response) -> Result<Dispatched, UnmatchedResponseError> {
        let Some(id) = response.id.clone() else {
            return Err(UnmatchedResponseError { id: None });
        };
        let Some(entry) = self.lock_pending().remove(&id) else {
            return Err(UnmatchedResponseError { id: Some(id) });
        };

        debug!(
            target: ROUTER_TARGET,
            %id,
            method = %entry.method,
            elapsed_ms = elapsed_millis(entry.submitted_at),
            "response received"
        );
        resolve(entry, response.into_result().map_err(SessionError::from_jsonrpc));
        Ok(Dispatched::Response { id })
    }

    fn on_notification(&self, notification: &Notification) -> Dispatched {
        let handlers: Vec<NotificationHandler> = self
            .read_handlers()
            .get(notification.method.as_str())
            .map(|entries| entries.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(notification);
        }

        trace!(
            target: ROUTER_TARGET,
            method = %notification.method,
            handlers = handlers.len(),
            "notification dispatched"
        );
        Dispatched::Notification {
            method: notification.method.clone(),
            handlers: handlers.len(),
        }
    }

    fn on_server_request(&self, request: Request) -> Dispatched {
        debug!(
            target: ROUTER_TARGET,
            id = %request.id,
            method = %request.method,
            "refusing server request"
        );
        let reply = Response::err(
            Some(request.id),
            JsonRpcError::method_not_found(&request.method),
        );
        if let Err(error) = self.respond(reply) {
            warn!(
                target: ROUTER_TARGET,
                method = %request.method,
                %error,
                "failed to answer server request"
            );
        }
        Dispatched::ServerRequest {
            method: request.method,
        }
    }

    /// Registers a handler for notifications of `method`.
    pub fn subscribe(&self, method: &str, handler: NotificationHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.write_handlers()
            .entry(method.to_owned())
            .or_default()
            .push((id, handler));
        id
    }

    /// Removes a subscription. Returns `false` when it was already gone.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut handlers = self.write_handlers();
        let mut removed = false;
        for entries in handlers.values_mut() {
            let before = entries.len();
            entries.retain(|(id, _)| *id != subscription);
            removed |= entries.len() != before;
        }
        handlers.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Resolves a pending request with `Cancelled` and asks the server to
    /// abandon it.
    ///
    /// Returns `false` when the request had already been resolved.
    pub fn cancel(&self, id: &RequestId) -> bool {
        if !self.complete(id, Err(SessionError::Cancelled { id: id.clone() })) {
            return false;
        }
        self.notify_cancel(id);
        true
    }

    /// Resolves a pending request with `Timeout` and asks the server to
    /// abandon it.
    pub fn expire(&self, id: &RequestId, method: &str, timeout: Duration) -> bool {
        if !self.complete(id, Err(SessionError::timeout(method, timeout))) {
            return false;
        }
        debug!(target: ROUTER_TARGET, %id, method, ?timeout, "request timed out");
        self.notify_cancel(id);
        true
    }

    fn notify_cancel(&self, id: &RequestId) {
        let params = json!({ "id": id });
        if let Err(error) = self.send_notification(CANCEL_REQUEST_METHOD, Some(params)) {
            debug!(target: ROUTER_TARGET, %id, %error, "cancel notification not delivered");
        }
    }

    /// Resolves a pending request with `outcome`.
    ///
    /// Returns `false` when no request with `id` is pending.
    pub fn complete(&self, id: &RequestId, outcome: Result<Value, SessionError>) -> bool {
        let Some(entry) = self.lock_pending().remove(id) else {
            return false;
        };
        resolve(entry, outcome);
        true
    }

    /// Resolves every pending request with the error produced by `error`.
    ///
    /// Returns the number of requests resolved.
    pub fn fail_all(&self, error: impl Fn(&RequestId) -> SessionError) -> usize {
        let drained: Vec<(RequestId, PendingEntry)> = self.lock_pending().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            let failure = error(&id);
            resolve(entry, Err(failure));
        }
        count
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn write(&self, message: &Message) -> Result<(), SessionError> {
        let mut writer = self.lock_writer();
        let Some(active) = writer.as_mut() else {
            return Err(SessionError::crashed("transport is closed"));
        };
        active
            .write_message(message)
            .map_err(|error| SessionError::crashed(format!("transport write failed: {error}")))
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, Option<SharedWriter>> {
        self.writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read_handlers(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<(SubscriptionId, NotificationHandler)>>>
    {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_handlers(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<(SubscriptionId, NotificationHandler)>>>
    {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn resolve(entry: PendingEntry, outcome: Outcome) {
    // The caller may have dropped its handle; the outcome is then discarded.
    if entry.completion.try_send(outcome).is_err() {
        trace!(target: ROUTER_TARGET, method = %entry.method, "request handle already dropped");
    }
}

fn elapsed_millis(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Handle on a request awaiting its response.
///
/// The handle resolves exactly once: with the response, or with the error
/// produced by a timeout, a cancellation or session teardown.
#[must_use = "dropping the handle discards the response"]
pub struct PendingResponse {
    id: RequestId,
    method: String,
    receiver: Receiver<Outcome>,
    router: Weak<Router>,
}

impl PendingResponse {
    /// Identifier allocated to the request.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Method of the request.
    #[must_use]
    pub fn method(&self) -> &str {
        self.method.as_str()
    }

    /// Returns a handle that can cancel the request from another thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id.clone(),
            router: Weak::clone(&self.router),
        }
    }

    /// Cancels the request. Returns `false` when it had already resolved.
    pub fn cancel(&self) -> bool {
        self.cancel_handle().cancel()
    }

    /// Blocks until the request resolves or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Timeout`] when `timeout` elapses first, or the
    /// error the request was resolved with.
    pub fn wait(self, timeout: Duration) -> Result<Value, SessionError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if let Some(router) = self.router.upgrade() {
                    router.expire(&self.id, &self.method, timeout);
                }
                // Either the expiry above or a concurrent resolution has sent
                // exactly one outcome; a dropped router leaves none.
                self.receiver
                    .recv()
                    .unwrap_or_else(|_| Err(self.released()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.released()),
        }
    }

    fn released(&self) -> SessionError {
        SessionError::crashed(format!(
            "session released request {} ('{}') without a response",
            self.id, self.method
        ))
    }
}

/// Cancels a request from any thread.
#[derive(Clone)]
pub struct CancelHandle {
    id: RequestId,
    router: Weak<Router>,
}

impl CancelHandle {
    /// Identifier of the request this handle cancels.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Cancels the request. Returns `false` when it had already resolved or
    /// its session is gone.
    pub fn cancel(&self) -> bool {
        self.router
            .upgrade()
            .is_some_and(|router| router.cancel(&self.id))
    }
}
