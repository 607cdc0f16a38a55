//! Scripted in-memory language server connected to the client through pipes.

use std::io::{self, BufReader, PipeReader, PipeWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::jsonrpc::{JsonRpcError, Message, Notification, Request, RequestId, Response, error_codes};
use crate::language::LanguageId;
use crate::supervisor::{
    ExitEvent, ExitEvents, ExitNotifier, LaunchedServer, ServerIo, ServerLauncher, ServerProcess,
    SpawnError,
};
use crate::transport::{MessageReader, encode};

static NEXT_PID: AtomicU32 = AtomicU32::new(40_000);

/// SIGKILL, as reported for killed servers.
pub const KILLED: i32 = 9;

/// SIGTERM, as reported for servers that honoured a graceful termination.
pub const TERMINATED: i32 = 15;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How the fake server reacts to the client.
///
/// Requests it knows:
/// - `initialize` answers with full document sync and `serverInfo`;
/// - `echo` returns its params;
/// - `fail` answers with an internal error;
/// - `textDocument/hover` returns [`ServerScript::hover_result`];
/// - `garble` writes a frame whose payload is not JSON;
/// - `shutdown` answers `null`.
///
/// Any other request is never answered. Notifications `kidl/ping` (echoed as
/// `kidl/pong`) and `kidl/stray` (answered with a response for an unknown
/// id) exercise inbound dispatch.
#[derive(Debug, Clone)]
pub struct ServerScript {
    /// Whether `initialize` is answered.
    pub answer_initialize: bool,
    /// Whether `shutdown` is answered.
    pub answer_shutdown: bool,
    /// Whether the `exit` notification ends the process.
    pub exit_on_exit: bool,
    /// Whether a graceful termination is ignored until the grace expires.
    pub ignore_terminate: bool,
    /// Whether `initialized` triggers a `workspace/configuration` request.
    pub ask_configuration: bool,
    /// Result returned for `textDocument/hover`.
    pub hover_result: Value,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            answer_initialize: true,
            answer_shutdown: true,
            exit_on_exit: true,
            ignore_terminate: false,
            ask_configuration: false,
            hover_result: Value::Null,
        }
    }
}

impl ServerScript {
    /// Server that never answers `initialize`.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            answer_initialize: false,
            ..Self::default()
        }
    }

    /// Server that ignores every attempt to stop it gracefully.
    #[must_use]
    pub fn stubborn() -> Self {
        Self {
            answer_shutdown: false,
            exit_on_exit: false,
            ignore_terminate: true,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct ExitSlot {
    event: Option<ExitEvent>,
    notifiers: Vec<ExitNotifier>,
}

type TerminateProbe = Box<dyn FnOnce() + Send>;

struct ServerState {
    language: LanguageId,
    pid: u32,
    script: ServerScript,
    received: Mutex<Vec<Message>>,
    stdout: Mutex<Option<PipeWriter>>,
    exit: Mutex<ExitSlot>,
    terminations: Mutex<Vec<Duration>>,
    probe: Mutex<Option<TerminateProbe>>,
    finished: AtomicBool,
}

/// Test-side handle on one fake server.
#[derive(Clone)]
pub struct FakeServer {
    inner: Arc<ServerState>,
}

impl FakeServer {
    /// Starts a server thread and returns the client's end of its stdio.
    fn launch(language: &LanguageId, script: ServerScript) -> io::Result<(Self, ServerIo)> {
        let (server_stdin, client_writer) = io::pipe()?;
        let (client_reader, server_stdout) = io::pipe()?;
        let server = Self {
            inner: Arc::new(ServerState {
                language: language.clone(),
                pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
                script,
                received: Mutex::new(Vec::new()),
                stdout: Mutex::new(Some(server_stdout)),
                exit: Mutex::new(ExitSlot::default()),
                terminations: Mutex::new(Vec::new()),
                probe: Mutex::new(None),
                finished: AtomicBool::new(false),
            }),
        };
        let worker = server.clone();
        thread::Builder::new()
            .name(format!("fake-server-{}", server.pid()))
            .spawn(move || {
                worker.serve(server_stdin);
                worker.inner.finished.store(true, Ordering::SeqCst);
            })?;
        Ok((
            server,
            ServerIo {
                reader: Box::new(client_reader),
                writer: Box::new(client_writer),
            },
        ))
    }

    /// Fake process id.
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Language the server was launched for.
    pub fn language(&self) -> &LanguageId {
        &self.inner.language
    }

    /// Every message received from the client, in arrival order.
    pub fn received(&self) -> Vec<Message> {
        lock(&self.inner.received).clone()
    }

    /// Methods of the requests and notifications received, in order.
    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(Message::method)
            .map(str::to_owned)
            .collect()
    }

    /// Responses the client sent to server-initiated requests.
    pub fn responses(&self) -> Vec<Response> {
        self.received()
            .into_iter()
            .filter_map(|message| match message {
                Message::Response(response) => Some(response),
                Message::Request(_) | Message::Notification(_) => None,
            })
            .collect()
    }

    /// Notifications received for `method`.
    pub fn notifications(&self, method: &str) -> Vec<Notification> {
        self.received()
            .into_iter()
            .filter_map(|message| match message {
                Message::Notification(notification) if notification.method == method => {
                    Some(notification)
                }
                _ => None,
            })
            .collect()
    }

    /// Grace periods passed to `terminate`, in call order.
    pub fn terminations(&self) -> Vec<Duration> {
        lock(&self.inner.terminations).clone()
    }

    /// Exit event, once the fake process has exited.
    pub fn exit_event(&self) -> Option<ExitEvent> {
        lock(&self.inner.exit).event
    }

    /// Runs `probe` at the start of the first `terminate` call.
    pub fn on_terminate(&self, probe: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.probe) = Some(Box::new(probe));
    }

    /// Makes the process exit on its own with `code`.
    pub fn crash(&self, code: i32) -> ExitEvent {
        self.exit(ExitEvent::Exited { code })
    }

    /// Writes a message to the client.
    pub fn send(&self, message: &Message) {
        let frame = encode(message).expect("fake server frames encode");
        self.write_frame(&frame);
    }

    /// Writes raw bytes to the client.
    pub fn send_raw(&self, bytes: &[u8]) {
        self.write_frame(bytes);
    }

    fn write_frame(&self, bytes: &[u8]) {
        let mut stdout = lock(&self.inner.stdout);
        let failed = stdout
            .as_mut()
            .is_some_and(|writer| writer.write_all(bytes).and_then(|()| writer.flush()).is_err());
        if failed {
            stdout.take();
        }
    }

    /// Records the exit event once and closes the server's stdout.
    fn exit(&self, event: ExitEvent) -> ExitEvent {
        let recorded = {
            let mut slot = lock(&self.inner.exit);
            match slot.event {
                Some(existing) => existing,
                None => {
                    slot.event = Some(event);
                    for notifier in slot.notifiers.drain(..) {
                        notifier.notify(event);
                    }
                    event
                }
            }
        };
        lock(&self.inner.stdout).take();
        recorded
    }

    fn serve(&self, stdin: PipeReader) {
        for item in MessageReader::new(BufReader::new(stdin)) {
            let Ok(message) = item else {
                return;
            };
            lock(&self.inner.received).push(message.clone());
            match message {
                Message::Request(request) => self.answer(&request),
                Message::Notification(notification) => {
                    if !self.on_notification(&notification) {
                        return;
                    }
                }
                Message::Response(_) => {}
            }
        }
    }

    fn answer(&self, request: &Request) {
        let script = &self.inner.script;
        let id = request.id.clone();
        let reply = match request.method.as_str() {
            "initialize" if script.answer_initialize => Response::ok(id, initialize_result()),
            "shutdown" if script.answer_shutdown => Response::ok(id, Value::Null),
            "echo" => Response::ok(id, request.params.clone().unwrap_or(Value::Null)),
            "fail" => Response::err(
                Some(id),
                JsonRpcError::new(error_codes::INTERNAL_ERROR, "analysis failed"),
            ),
            "textDocument/hover" => Response::ok(id, script.hover_result.clone()),
            "garble" => {
                self.send_raw(b"Content-Length: 5\r\n\r\n{oops");
                return;
            }
            _ => return,
        };
        self.send(&Message::Response(reply));
    }

    /// Returns `false` once the server should stop reading.
    fn on_notification(&self, notification: &Notification) -> bool {
        match notification.method.as_str() {
            "exit" if self.inner.script.exit_on_exit => {
                self.exit(ExitEvent::Exited { code: 0 });
                return false;
            }
            "initialized" if self.inner.script.ask_configuration => self.send(&Message::request(
                RequestId::String("srv-1".into()),
                "workspace/configuration",
                Some(json!({"items": [{"section": "kidl"}]})),
            )),
            "kidl/ping" => self.send(&Message::notification(
                "kidl/pong",
                notification.params.clone(),
            )),
            "kidl/stray" => self.send(&Message::Response(Response::ok(
                RequestId::Number(999),
                Value::Null,
            ))),
            _ => {}
        }
        true
    }
}

fn initialize_result() -> Value {
    json!({
        "capabilities": {"textDocumentSync": 1},
        "serverInfo": {"name": "kidl-lsp", "version": "0.1.0"}
    })
}

struct FakeProcess {
    server: FakeServer,
}

impl ServerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.server.pid())
    }

    fn watch(&self) -> ExitEvents {
        let mut slot = lock(&self.server.inner.exit);
        if let Some(event) = slot.event {
            return ExitEvents::ready(event);
        }
        let (notifier, events) = ExitEvents::channel();
        slot.notifiers.push(notifier);
        events
    }

    fn terminate(&self, grace: Duration) -> Option<ExitEvent> {
        let probe = lock(&self.server.inner.probe).take();
        if let Some(run) = probe {
            run();
        }
        lock(&self.server.inner.terminations).push(grace);
        if let Some(event) = self.server.exit_event() {
            return Some(event);
        }
        if grace.is_zero() {
            return Some(self.server.exit(ExitEvent::Signalled { signal: KILLED }));
        }

        // Let the server drain frames already written, as a real process
        // would before acting on SIGTERM.
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(event) = self.server.exit_event() {
                return Some(event);
            }
            let drained = self.server.inner.finished.load(Ordering::SeqCst);
            if drained && !self.server.inner.script.ignore_terminate {
                return Some(self.server.exit(ExitEvent::Signalled { signal: TERMINATED }));
            }
            thread::sleep(Duration::from_millis(5));
        }
        Some(self.server.exit(ExitEvent::Signalled { signal: KILLED }))
    }
}

/// Launcher handing out fake servers and remembering each one.
pub struct FakeLauncher {
    script: ServerScript,
    fail_spawn: bool,
    servers: Mutex<Vec<FakeServer>>,
    attempts: AtomicU32,
}

impl FakeLauncher {
    /// Launcher whose servers follow `script`.
    pub fn new(script: ServerScript) -> Self {
        Self {
            script,
            fail_spawn: false,
            servers: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
        }
    }

    /// Launcher whose executable cannot be found.
    pub fn missing_executable() -> Self {
        Self {
            fail_spawn: true,
            ..Self::new(ServerScript::default())
        }
    }

    /// Number of launch attempts, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Servers launched so far.
    pub fn servers(&self) -> Vec<FakeServer> {
        lock(&self.servers).clone()
    }

    /// The most recently launched server.
    pub fn last(&self) -> FakeServer {
        self.servers().pop().expect("a server was launched")
    }
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new(ServerScript::default())
    }
}

impl ServerLauncher for FakeLauncher {
    fn launch(&self, language: &LanguageId) -> Result<LaunchedServer, SpawnError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_spawn {
            return Err(SpawnError::from_io(
                "/opt/kidl/kidl-cli".to_owned(),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        let (server, io) = FakeServer::launch(language, self.script.clone())
            .map_err(|error| SpawnError::from_io("fake-server".to_owned(), error))?;
        lock(&self.servers).push(server.clone());
        Ok(LaunchedServer {
            io,
            process: Box::new(FakeProcess { server }),
        })
    }
}
