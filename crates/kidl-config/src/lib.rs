//! Shared configuration for the KIDL language client.
//!
//! [`Config`] is loaded through `ortho_config`, layering built-in defaults,
//! a configuration file (`--config-path`), `KIDL_*` environment variables and
//! command-line flags (later layers win). The crate also owns discovery of the
//! language server executable; see [`Config::resolve_server_path`].

mod defaults;
mod logging;
mod server;

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_DEACTIVATE_TIMEOUT_MS, DEFAULT_GRACE_TIMEOUT_MS, DEFAULT_INITIALIZE_TIMEOUT_MS,
    DEFAULT_LANGUAGE_ID, DEFAULT_LOG_FILTER, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_SHUTDOWN_TIMEOUT_MS, SERVER_BINARY_NAME, SERVER_PATH_ENV, SERVER_SUBCOMMAND,
    default_install_dir, default_language_id, default_log_filter_string,
    default_log_format,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use server::{ServerLocation, ServerPathSource};

/// Resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "KIDL")]
pub struct Config {
    /// Language identifier routed to the server.
    #[ortho_config(default = defaults::default_language_id())]
    pub language_id: String,
    /// Explicit server executable, taking precedence over the install directory.
    pub server_path: Option<Utf8PathBuf>,
    /// Directory holding the bundled `kidl-cli` executable.
    pub install_dir: Option<Utf8PathBuf>,
    /// `tracing` filter expression.
    #[ortho_config(default = defaults::default_log_filter_string())]
    pub log_filter: String,
    /// Output format for log events.
    #[ortho_config(default = defaults::default_log_format())]
    pub log_format: LogFormat,
    /// Bound on the `initialize` handshake, in milliseconds.
    #[ortho_config(default = defaults::DEFAULT_INITIALIZE_TIMEOUT_MS)]
    pub initialize_timeout_ms: u64,
    /// Bound on ordinary requests, in milliseconds.
    #[ortho_config(default = defaults::DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,
    /// Bound on the `shutdown` request, in milliseconds.
    #[ortho_config(default = defaults::DEFAULT_SHUTDOWN_TIMEOUT_MS)]
    pub shutdown_timeout_ms: u64,
    /// Time a server is given to exit before it is killed, in milliseconds.
    #[ortho_config(default = defaults::DEFAULT_GRACE_TIMEOUT_MS)]
    pub grace_timeout_ms: u64,
    /// Overall bound on deactivation, in milliseconds.
    #[ortho_config(default = defaults::DEFAULT_DEACTIVATE_TIMEOUT_MS)]
    pub deactivate_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            language_id: default_language_id(),
            server_path: None,
            install_dir: None,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            initialize_timeout_ms: DEFAULT_INITIALIZE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            grace_timeout_ms: DEFAULT_GRACE_TIMEOUT_MS,
            deactivate_timeout_ms: DEFAULT_DEACTIVATE_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Loads configuration from the process arguments, environment and files.
    ///
    /// # Errors
    ///
    /// Returns the aggregated `ortho_config` error when any layer is invalid.
    pub fn load() -> Result<Self, Arc<OrthoError>> {
        <Self as OrthoConfig>::load()
    }

    /// Loads configuration using an explicit argument list.
    ///
    /// # Errors
    ///
    /// Returns the aggregated `ortho_config` error when any layer is invalid.
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, Arc<OrthoError>>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        <Self as OrthoConfig>::load_from_iter(args)
    }

    /// Language identifier routed to the server.
    #[must_use]
    pub fn language_id(&self) -> &str {
        self.language_id.as_str()
    }

    /// Configured log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Configured log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Bound on the `initialize` handshake.
    #[must_use]
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    /// Bound on ordinary requests.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Bound on the `shutdown` request.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Time a server is given to exit before it is killed.
    #[must_use]
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    /// Overall bound on deactivation.
    #[must_use]
    pub fn deactivate_timeout(&self) -> Duration {
        Duration::from_millis(self.deactivate_timeout_ms)
    }
}
