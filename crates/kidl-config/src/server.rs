//! Discovery of the language server executable.
//!
//! The server is looked up in three places, first match wins:
//!
//! 1. the `__KIDL_LSP_SERVER` environment variable,
//! 2. the `server_path` configuration value,
//! 3. `kidl-cli` inside the install directory.

use std::ffi::OsString;
use std::fmt;

use camino::Utf8PathBuf;

use crate::Config;
use crate::defaults::{SERVER_BINARY_NAME, SERVER_PATH_ENV, default_install_dir};

/// Where the resolved server path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPathSource {
    /// `__KIDL_LSP_SERVER` was set.
    Environment,
    /// `server_path` was configured.
    Configuration,
    /// Derived from the install directory.
    InstallDir,
}

impl fmt::Display for ServerPathSource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Environment => "environment",
            Self::Configuration => "configuration",
            Self::InstallDir => "install directory",
        };
        formatter.write_str(label)
    }
}

/// Server executable path together with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLocation {
    /// Path handed to the process supervisor.
    pub path: Utf8PathBuf,
    /// How the path was chosen.
    pub source: ServerPathSource,
}

impl Config {
    /// Resolves the server executable using the process environment.
    #[must_use]
    pub fn resolve_server_path(&self) -> ServerLocation {
        self.resolve_server_path_with(|key| std::env::var_os(key))
    }

    /// Resolves the server executable with an injectable environment lookup.
    ///
    /// Empty or non-UTF-8 environment values are ignored.
    #[must_use]
    pub fn resolve_server_path_with<F>(&self, lookup: F) -> ServerLocation
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let from_env = lookup(SERVER_PATH_ENV)
            .and_then(|value| value.into_string().ok())
            .filter(|value| !value.trim().is_empty());
        if let Some(value) = from_env {
            return ServerLocation {
                path: Utf8PathBuf::from(value),
                source: ServerPathSource::Environment,
            };
        }

        if let Some(path) = &self.server_path {
            return ServerLocation {
                path: path.clone(),
                source: ServerPathSource::Configuration,
            };
        }

        let install_dir = self
            .install_dir
            .clone()
            .unwrap_or_else(default_install_dir);
        ServerLocation {
            path: install_dir.join(SERVER_BINARY_NAME),
            source: ServerPathSource::InstallDir,
        }
    }
}
