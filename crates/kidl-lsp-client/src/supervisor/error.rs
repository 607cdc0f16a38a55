//! Launch failures for language server processes.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::language::LanguageId;

/// Errors raised while launching a language server.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The executable does not exist.
    #[error("language server executable not found: {program}")]
    NotFound {
        /// Program that was not found.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The executable exists but may not be run.
    #[error("language server executable is not executable: {program}")]
    NotExecutable {
        /// Program that was refused.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// Spawning failed for another reason.
    #[error("failed to spawn language server {program}")]
    Failed {
        /// Program that failed to start.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// A standard stream was not captured.
    #[error("language server {stream} was not captured")]
    MissingPipe {
        /// Name of the missing stream.
        stream: &'static str,
    },

    /// No command is configured for the language.
    #[error("no language server command is configured for '{language}'")]
    NoCommand {
        /// Language that has no command.
        language: LanguageId,
    },
}

impl SpawnError {
    /// Classifies an I/O error returned by `Command::spawn`.
    #[must_use]
    pub fn from_io(program: String, error: io::Error) -> Self {
        let source = Arc::new(error);
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { program, source },
            io::ErrorKind::PermissionDenied => Self::NotExecutable { program, source },
            _ => Self::Failed { program, source },
        }
    }
}
