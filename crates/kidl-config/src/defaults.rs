use std::env;

use camino::Utf8PathBuf;

use crate::logging::LogFormat;

/// Language identifier the client registers for by default.
pub const DEFAULT_LANGUAGE_ID: &str = "kidl";

/// File name of the language server executable shipped next to the client.
pub const SERVER_BINARY_NAME: &str = "kidl-cli";

/// Subcommand that switches the server executable into LSP mode.
pub const SERVER_SUBCOMMAND: &str = "lsp";

/// Environment variable that overrides the server executable location.
pub const SERVER_PATH_ENV: &str = "__KIDL_LSP_SERVER";

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default bound on the `initialize` handshake, in milliseconds.
pub const DEFAULT_INITIALIZE_TIMEOUT_MS: u64 = 10_000;

/// Default bound on an ordinary request, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default bound on the `shutdown` request, in milliseconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Default time a server is given to exit before it is killed, in milliseconds.
pub const DEFAULT_GRACE_TIMEOUT_MS: u64 = 2_000;

/// Default overall bound on deactivation, in milliseconds.
pub const DEFAULT_DEACTIVATE_TIMEOUT_MS: u64 = 10_000;

/// Default log filter expression as an owned `String`.
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Owned default language identifier.
#[must_use]
pub fn default_language_id() -> String {
    DEFAULT_LANGUAGE_ID.to_owned()
}

/// Default logging format.
#[must_use]
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Directory the client is installed in: the parent of the running executable.
///
/// Falls back to the current directory when the executable path cannot be
/// determined or is not valid UTF-8.
#[must_use]
pub fn default_install_dir() -> Utf8PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(std::path::Path::to_path_buf))
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."))
}
