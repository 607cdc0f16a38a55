//! Session timeouts and handshake options.

use std::time::Duration;

use kidl_config::{
    Config, DEFAULT_GRACE_TIMEOUT_MS, DEFAULT_INITIALIZE_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_SHUTDOWN_TIMEOUT_MS, SERVER_BINARY_NAME,
};
use lsp_types::{
    ClientCapabilities, ClientInfo, GeneralClientCapabilities, InitializeParams, PositionEncodingKind,
    TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities, WorkspaceFolder,
};
use serde_json::Value;

/// Bounds applied to a session's blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bound on the `initialize` handshake.
    pub initialize_timeout: Duration,
    /// Bound on ordinary requests.
    pub request_timeout: Duration,
    /// Bound on the `shutdown` request.
    pub shutdown_timeout: Duration,
    /// Time the server is given to exit before it is killed.
    pub grace_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initialize_timeout: Duration::from_millis(DEFAULT_INITIALIZE_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            grace_timeout: Duration::from_millis(DEFAULT_GRACE_TIMEOUT_MS),
        }
    }
}

impl SessionConfig {
    /// Reads the timeouts from client configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            initialize_timeout: config.initialize_timeout(),
            request_timeout: config.request_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            grace_timeout: config.grace_timeout(),
        }
    }
}

/// Client-side inputs to the `initialize` request.
#[derive(Debug, Clone, PartialEq)]
pub struct InitializeOptions {
    /// Name reported in `clientInfo`.
    pub client_name: String,
    /// Version reported in `clientInfo`.
    pub client_version: Option<String>,
    /// Workspace folders opened in the editor.
    pub workspace_folders: Vec<WorkspaceFolder>,
    /// Server-specific `initializationOptions`.
    pub initialization_options: Option<Value>,
    /// Capabilities advertised to the server.
    pub capabilities: ClientCapabilities,
}

impl Default for InitializeOptions {
    fn default() -> Self {
        Self {
            client_name: SERVER_BINARY_NAME.to_owned(),
            client_version: Some(env!("CARGO_PKG_VERSION").to_owned()),
            workspace_folders: Vec::new(),
            initialization_options: None,
            capabilities: default_capabilities(),
        }
    }
}

impl InitializeOptions {
    /// Adds a workspace folder.
    #[must_use]
    pub fn with_workspace_folder(mut self, folder: WorkspaceFolder) -> Self {
        self.workspace_folders.push(folder);
        self
    }

    /// Sets `initializationOptions`.
    #[must_use]
    pub fn with_initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    /// Builds the `initialize` parameters for the current process.
    #[must_use]
    pub fn to_params(&self) -> InitializeParams {
        let workspace_folders =
            (!self.workspace_folders.is_empty()).then(|| self.workspace_folders.clone());
        InitializeParams {
            process_id: Some(std::process::id()),
            capabilities: self.capabilities.clone(),
            initialization_options: self.initialization_options.clone(),
            workspace_folders,
            client_info: Some(ClientInfo {
                name: self.client_name.clone(),
                version: self.client_version.clone(),
            }),
            ..Default::default()
        }
    }
}

fn default_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        general: Some(GeneralClientCapabilities {
            position_encodings: Some(vec![PositionEncodingKind::UTF16]),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                did_save: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
