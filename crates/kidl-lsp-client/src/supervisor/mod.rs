//! Launching, watching and terminating language server processes.
//!
//! Sessions never spawn processes directly. They ask a [`ServerLauncher`] for
//! a [`LaunchedServer`], which pairs the server's stdio with a
//! [`ServerProcess`] used to watch for and force its exit. [`ProcessLauncher`]
//! is the production launcher; tests substitute in-memory servers.

mod error;
mod exit;
mod process;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use kidl_config::{Config, SERVER_SUBCOMMAND, ServerLocation};
use tracing::debug;

use crate::language::{LanguageId, LanguageIdError};

pub use error::SpawnError;
pub use exit::{ExitEvent, ExitEvents, ExitNotifier};
pub use process::ProcessHandle;

/// Log target for process supervision.
pub(crate) const SUPERVISOR_TARGET: &str = "kidl_lsp_client::supervisor";

/// Executable, arguments and environment used to start a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory; inherits the client's when unset.
    pub working_dir: Option<PathBuf>,
}

impl ServerCommand {
    /// Command running `program` without arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Builds the `kidl-cli lsp` command from a resolved server location.
    #[must_use]
    pub fn from_location(location: &ServerLocation) -> Self {
        Self::new(location.path.as_std_path()).arg(SERVER_SUBCOMMAND)
    }

    /// Resolves the server executable from configuration and the environment.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let location = config.resolve_server_path();
        debug!(
            target: SUPERVISOR_TARGET,
            path = %location.path,
            source = %location.source,
            "resolved language server executable"
        );
        Self::from_location(&location)
    }
}

/// The server's standard streams as seen by the client.
pub struct ServerIo {
    /// Server stdout, carrying framed messages to the client.
    pub reader: Box<dyn Read + Send>,
    /// Server stdin, carrying framed messages to the server.
    pub writer: Box<dyn Write + Send>,
}

/// Control surface over a running server.
pub trait ServerProcess: Send + Sync {
    /// Operating system process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Sequence yielding the process's exit event.
    fn watch(&self) -> ExitEvents;

    /// Asks the process to exit, waits up to `grace`, then kills it.
    ///
    /// Always reaps the process. Returns the exit event when known.
    fn terminate(&self, grace: Duration) -> Option<ExitEvent>;
}

/// A started server: its stdio plus process control.
pub struct LaunchedServer {
    /// Standard streams.
    pub io: ServerIo,
    /// Process control.
    pub process: Box<dyn ServerProcess>,
}

/// Creates servers for sessions.
pub trait ServerLauncher: Send + Sync {
    /// Starts a server for `language`.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] when no server can be started.
    fn launch(&self, language: &LanguageId) -> Result<LaunchedServer, SpawnError>;
}

/// Launches servers as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    commands: HashMap<LanguageId, ServerCommand>,
}

impl ProcessLauncher {
    /// Launcher with no registered commands.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Launcher serving the configured language with the discovered server.
    ///
    /// # Errors
    ///
    /// Returns [`LanguageIdError`] when the configured language is blank.
    pub fn from_config(config: &Config) -> Result<Self, LanguageIdError> {
        let language = LanguageId::new(config.language_id())?;
        Ok(Self::new().with_command(language, ServerCommand::from_config(config)))
    }

    /// Registers the command used for `language`.
    #[must_use]
    pub fn with_command(mut self, language: LanguageId, command: ServerCommand) -> Self {
        self.commands.insert(language, command);
        self
    }

    /// Command registered for `language`.
    #[must_use]
    pub fn command(&self, language: &LanguageId) -> Option<&ServerCommand> {
        self.commands.get(language)
    }
}

impl ServerLauncher for ProcessLauncher {
    fn launch(&self, language: &LanguageId) -> Result<LaunchedServer, SpawnError> {
        let command = self
            .commands
            .get(language)
            .ok_or_else(|| SpawnError::NoCommand {
                language: language.clone(),
            })?;
        let (handle, io) = ProcessHandle::spawn(command)?;
        Ok(LaunchedServer {
            io,
            process: Box::new(handle),
        })
    }
}
