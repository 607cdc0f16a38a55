//! Error types surfaced by sessions, the router and the registrar.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::jsonrpc::{JsonRpcError, RequestId};
use crate::language::LanguageId;
use crate::session::SessionState;
use crate::supervisor::SpawnError;

/// Coarse classification of [`SessionError`], for callers that only need to
/// branch on the failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorKind {
    /// A bounded wait elapsed.
    Timeout,
    /// The server process or its transport went away.
    Crashed,
    /// The server sent something the client cannot interpret.
    ProtocolViolation,
    /// The request was cancelled by the client or by teardown.
    Cancelled,
    /// The server process could not be launched.
    Spawn,
    /// The server answered with a JSON-RPC error.
    Server,
    /// The operation is not valid in the session's current state.
    InvalidState,
    /// No session can serve the requested language.
    UnsupportedLanguage,
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::Crashed => "crashed",
            Self::ProtocolViolation => "protocol_violation",
            Self::Cancelled => "cancelled",
            Self::Spawn => "spawn",
            Self::Server => "server",
            Self::InvalidState => "invalid_state",
            Self::UnsupportedLanguage => "unsupported_language",
        };
        formatter.write_str(label)
    }
}

/// Failure of a session operation.
///
/// Every blocking operation resolves with one of these rather than hanging.
/// The type is `Clone` so a single failure can resolve many pending requests.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// A request or handshake was not answered in time.
    #[error("'{method}' timed out after {timeout:?}")]
    Timeout {
        /// Method that timed out.
        method: String,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// The server exited or its transport closed.
    #[error("language server crashed: {reason}")]
    Crashed {
        /// What was observed.
        reason: String,
    },

    /// The server broke the wire protocol.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// What was malformed.
        reason: String,
    },

    /// The request was cancelled before a response arrived.
    #[error("request {id} was cancelled")]
    Cancelled {
        /// Identifier of the cancelled request.
        id: RequestId,
    },

    /// The server process could not be launched.
    #[error(transparent)]
    Spawn(Arc<SpawnError>),

    /// The server answered with an error response.
    #[error("server returned error {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the server.
        message: String,
        /// Optional additional data.
        data: Option<Value>,
    },

    /// The session cannot serve the operation in its current state.
    #[error("session for '{language}' is {state}; operation requires {expected}")]
    InvalidState {
        /// Language served by the session.
        language: LanguageId,
        /// State observed.
        state: SessionState,
        /// State the operation needs.
        expected: SessionState,
    },

    /// The language is not routed by the document selector.
    #[error("no language server is configured for '{language}'")]
    UnsupportedLanguage {
        /// Language requested by the caller, as supplied.
        language: String,
    },
}

impl SessionError {
    /// Returns the coarse failure category.
    #[must_use]
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::Timeout { .. } => SessionErrorKind::Timeout,
            Self::Crashed { .. } => SessionErrorKind::Crashed,
            Self::ProtocolViolation { .. } => SessionErrorKind::ProtocolViolation,
            Self::Cancelled { .. } => SessionErrorKind::Cancelled,
            Self::Spawn(_) => SessionErrorKind::Spawn,
            Self::Server { .. } => SessionErrorKind::Server,
            Self::InvalidState { .. } => SessionErrorKind::InvalidState,
            Self::UnsupportedLanguage { .. } => SessionErrorKind::UnsupportedLanguage,
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(method: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            method: method.into(),
            timeout,
        }
    }

    /// Creates a crash error.
    #[must_use]
    pub fn crashed(reason: impl Into<String>) -> Self {
        Self::Crashed {
            reason: reason.into(),
        }
    }

    /// Creates a protocol violation error.
    #[must_use]
    pub fn protocol(reason: impl fmt::Display) -> Self {
        Self::ProtocolViolation {
            reason: reason.to_string(),
        }
    }

    /// Creates a server error from a JSON-RPC error object.
    #[must_use]
    pub fn from_jsonrpc(error: JsonRpcError) -> Self {
        Self::Server {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<SpawnError> for SessionError {
    fn from(error: SpawnError) -> Self {
        Self::Spawn(Arc::new(error))
    }
}

/// A response arrived for an id with no pending request.
///
/// Logged and dropped by the session; never fatal.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("response for unknown request id {}", display_id(.id.as_ref()))]
pub struct UnmatchedResponseError {
    /// Identifier carried by the response.
    pub id: Option<RequestId>,
}

fn display_id(id: Option<&RequestId>) -> String {
    id.map_or_else(|| "null".to_owned(), ToString::to_string)
}
