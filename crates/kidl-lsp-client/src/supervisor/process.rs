//! Child-process ownership: spawning, exit watching and termination.

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::exit::{ExitEvent, ExitEvents, ExitNotifier};
use super::{SUPERVISOR_TARGET, ServerCommand, ServerIo, ServerProcess, SpawnError};

/// Interval between exit polls while a process is alive.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Default)]
struct ExitRecord {
    event: Option<ExitEvent>,
    notifiers: Vec<ExitNotifier>,
}

/// Shared exit bookkeeping; whoever reaps the child records the event once.
#[derive(Default)]
struct ExitState(Mutex<ExitRecord>);

impl ExitState {
    fn lock(&self) -> MutexGuard<'_, ExitRecord> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: ExitEvent) -> ExitEvent {
        let mut record = self.lock();
        if let Some(existing) = record.event {
            return existing;
        }
        record.event = Some(event);
        for notifier in record.notifiers.drain(..) {
            notifier.notify(event);
        }
        event
    }

    fn event(&self) -> Option<ExitEvent> {
        self.lock().event
    }

    fn watch(&self) -> ExitEvents {
        let mut record = self.lock();
        if let Some(event) = record.event {
            return ExitEvents::ready(event);
        }
        let (notifier, events) = ExitEvents::channel();
        record.notifiers.push(notifier);
        events
    }
}

/// Exclusive owner of a spawned language server process.
///
/// Dropping the handle kills and reaps the process.
pub struct ProcessHandle {
    pid: u32,
    program: String,
    child: Arc<Mutex<Child>>,
    exit: Arc<ExitState>,
}

impl ProcessHandle {
    /// Spawns `command` with piped standard streams.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] when the executable is missing, not executable
    /// or fails to start.
    pub fn spawn(command: &ServerCommand) -> Result<(Self, ServerIo), SpawnError> {
        let program = command.program.display().to_string();
        debug!(
            target: SUPERVISOR_TARGET,
            program = %program,
            args = ?command.args,
            "spawning language server"
        );

        let mut builder = Command::new(&command.program);
        builder
            .args(&command.args)
            .envs(command.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.working_dir {
            builder.current_dir(dir);
        }

        let mut child = builder
            .spawn()
            .map_err(|error| SpawnError::from_io(program.clone(), error))?;

        let streams = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), stderr) = streams else {
            reap_now(&mut child);
            return Err(SpawnError::MissingPipe {
                stream: "stdin or stdout",
            });
        };

        let pid = child.id();
        let handle = Self {
            pid,
            program,
            child: Arc::new(Mutex::new(child)),
            exit: Arc::new(ExitState::default()),
        };
        handle.spawn_exit_watcher();
        if let Some(stream) = stderr {
            handle.spawn_stderr_forwarder(stream);
        }

        debug!(target: SUPERVISOR_TARGET, program = %handle.program, pid, "language server spawned");
        Ok((
            handle,
            ServerIo {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
            },
        ))
    }

    /// Operating system process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit event, once the process has been reaped.
    #[must_use]
    pub fn exit_event(&self) -> Option<ExitEvent> {
        self.exit.event()
    }

    fn lock_child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_exit_watcher(&self) {
        let child = Arc::downgrade(&self.child);
        let exit = Arc::clone(&self.exit);
        let pid = self.pid;
        let spawned = thread::Builder::new()
            .name(format!("kidl-exit-{pid}"))
            .spawn(move || poll_exit(&child, &exit, pid));
        if let Err(error) = spawned {
            warn!(target: SUPERVISOR_TARGET, pid, %error, "failed to start exit watcher");
        }
    }

    fn spawn_stderr_forwarder(&self, stderr: ChildStderr) {
        let pid = self.pid;
        let program = self.program.clone();
        let spawned = thread::Builder::new()
            .name(format!("kidl-stderr-{pid}"))
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(text) => debug!(target: SUPERVISOR_TARGET, pid, program = %program, "{text}"),
                        Err(error) => {
                            debug!(target: SUPERVISOR_TARGET, pid, %error, "stopped reading server stderr");
                            break;
                        }
                    }
                }
            });
        if let Err(error) = spawned {
            warn!(target: SUPERVISOR_TARGET, pid, %error, "failed to start stderr forwarder");
        }
    }

    fn try_reap(&self) -> Option<ExitEvent> {
        match self.lock_child().try_wait() {
            Ok(Some(status)) => Some(self.exit.record(ExitEvent::from_status(status))),
            Ok(None) | Err(_) => None,
        }
    }

    // The child lock is released between polls so a concurrent zero-grace
    // termination can kill the process mid-grace.
    fn terminate_child(&self, grace: Duration) -> ExitEvent {
        if let Some(event) = self.exit.event().or_else(|| self.try_reap()) {
            return event;
        }

        if !grace.is_zero() {
            request_exit(self.pid);
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                if let Some(event) = self.try_reap() {
                    debug!(target: SUPERVISOR_TARGET, pid = self.pid, %event, "language server exited during grace period");
                    return event;
                }
                thread::sleep(EXIT_POLL_INTERVAL);
            }
            warn!(
                target: SUPERVISOR_TARGET,
                pid = self.pid,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "language server did not exit within the grace period, killing"
            );
        }

        let event = reap_now(&mut self.lock_child());
        self.exit.record(event)
    }
}

impl ServerProcess for ProcessHandle {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn watch(&self) -> ExitEvents {
        self.exit.watch()
    }

    fn terminate(&self, grace: Duration) -> Option<ExitEvent> {
        Some(self.terminate_child(grace))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit.event().is_some() {
            return;
        }
        let event = reap_now(&mut self.lock_child());
        self.exit.record(event);
        debug!(target: SUPERVISOR_TARGET, pid = self.pid, %event, "language server released");
    }
}

fn poll_exit(child: &Weak<Mutex<Child>>, exit: &ExitState, pid: u32) {
    loop {
        if exit.event().is_some() {
            return;
        }
        let Some(shared) = child.upgrade() else {
            return;
        };
        let polled = shared.lock().unwrap_or_else(PoisonError::into_inner).try_wait();
        drop(shared);
        match polled {
            Ok(Some(status)) => {
                let event = exit.record(ExitEvent::from_status(status));
                debug!(target: SUPERVISOR_TARGET, pid, %event, "language server exited");
                return;
            }
            Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
            Err(error) => {
                warn!(target: SUPERVISOR_TARGET, pid, %error, "failed to poll language server status");
                exit.record(ExitEvent::Unknown);
                return;
            }
        }
    }
}

/// Kills the child if it is still running and reaps it.
fn reap_now(child: &mut Child) -> ExitEvent {
    if let Ok(Some(status)) = child.try_wait() {
        return ExitEvent::from_status(status);
    }
    if let Err(error) = child.kill() {
        debug!(target: SUPERVISOR_TARGET, pid = child.id(), %error, "kill failed");
    }
    match child.wait() {
        Ok(status) => ExitEvent::from_status(status),
        Err(error) => {
            warn!(target: SUPERVISOR_TARGET, pid = child.id(), %error, "failed to reap language server");
            ExitEvent::Unknown
        }
    }
}

#[cfg(unix)]
fn request_exit(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(error) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(target: SUPERVISOR_TARGET, pid, %error, "SIGTERM was not delivered");
    }
}

#[cfg(not(unix))]
fn request_exit(_pid: u32) {}
