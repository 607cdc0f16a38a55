//! Capabilities negotiated during the `initialize` handshake.

use lsp_types::{
    InitializeResult, PositionEncodingKind, ServerCapabilities, ServerInfo, TextDocumentSyncCapability,
    TextDocumentSyncKind,
};

/// Server capabilities recorded when a session reaches `Running`.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedCapabilities {
    result: InitializeResult,
}

impl NegotiatedCapabilities {
    /// Wraps the server's `initialize` result.
    #[must_use]
    pub const fn new(result: InitializeResult) -> Self {
        Self { result }
    }

    /// Capabilities advertised by the server.
    #[must_use]
    pub const fn server_capabilities(&self) -> &ServerCapabilities {
        &self.result.capabilities
    }

    /// Name and version reported by the server.
    #[must_use]
    pub const fn server_info(&self) -> Option<&ServerInfo> {
        self.result.server_info.as_ref()
    }

    /// Position encoding chosen by the server; UTF-16 when unspecified.
    #[must_use]
    pub fn position_encoding(&self) -> PositionEncodingKind {
        self.result
            .capabilities
            .position_encoding
            .clone()
            .unwrap_or(PositionEncodingKind::UTF16)
    }

    /// How the server wants document changes delivered.
    #[must_use]
    pub fn text_document_sync(&self) -> TextDocumentSyncKind {
        match &self.result.capabilities.text_document_sync {
            Some(TextDocumentSyncCapability::Kind(kind)) => *kind,
            Some(TextDocumentSyncCapability::Options(options)) => {
                options.change.unwrap_or(TextDocumentSyncKind::NONE)
            }
            None => TextDocumentSyncKind::NONE,
        }
    }

    /// Whether the server wants `didOpen`/`didClose` notifications.
    #[must_use]
    pub fn wants_open_close(&self) -> bool {
        match &self.result.capabilities.text_document_sync {
            Some(TextDocumentSyncCapability::Kind(kind)) => *kind != TextDocumentSyncKind::NONE,
            Some(TextDocumentSyncCapability::Options(options)) => {
                options.open_close.unwrap_or(false)
            }
            None => false,
        }
    }

    /// The raw `initialize` result.
    #[must_use]
    pub const fn as_initialize_result(&self) -> &InitializeResult {
        &self.result
    }
}
