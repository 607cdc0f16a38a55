//! Session lifecycle notifications.

use std::sync::Arc;

use crate::capability::NegotiatedCapabilities;
use crate::errors::SessionError;
use crate::language::LanguageId;
use crate::session::SessionId;

/// Log target for lifecycle notifications.
const STATUS_TARGET: &str = "kidl_lsp_client::status";

/// Observer notified as sessions move through their lifecycle.
///
/// `session_crashed` is invoked at most once per session.
pub trait StatusReporter: Send + Sync {
    /// A server is being launched for `language`.
    fn session_starting(&self, language: &LanguageId, session: SessionId);

    /// The handshake completed.
    fn session_running(
        &self,
        language: &LanguageId,
        session: SessionId,
        capabilities: &NegotiatedCapabilities,
    );

    /// The session failed and is now `Crashed`.
    fn session_crashed(&self, language: &LanguageId, session: SessionId, error: &SessionError);

    /// The session shut down on request.
    fn session_stopped(&self, language: &LanguageId, session: SessionId);
}

impl<T> StatusReporter for Arc<T>
where
    T: StatusReporter + ?Sized,
{
    fn session_starting(&self, language: &LanguageId, session: SessionId) {
        (**self).session_starting(language, session);
    }

    fn session_running(
        &self,
        language: &LanguageId,
        session: SessionId,
        capabilities: &NegotiatedCapabilities,
    ) {
        (**self).session_running(language, session, capabilities);
    }

    fn session_crashed(&self, language: &LanguageId, session: SessionId, error: &SessionError) {
        (**self).session_crashed(language, session, error);
    }

    fn session_stopped(&self, language: &LanguageId, session: SessionId) {
        (**self).session_stopped(language, session);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusReporter;

impl TracingStatusReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl StatusReporter for TracingStatusReporter {
    fn session_starting(&self, language: &LanguageId, session: SessionId) {
        tracing::info!(
            target: STATUS_TARGET,
            event = "session_starting",
            %language,
            %session,
            "starting language server"
        );
    }

    fn session_running(
        &self,
        language: &LanguageId,
        session: SessionId,
        capabilities: &NegotiatedCapabilities,
    ) {
        let server = capabilities
            .server_info()
            .map_or("unknown", |info| info.name.as_str());
        tracing::info!(
            target: STATUS_TARGET,
            event = "session_running",
            %language,
            %session,
            server,
            position_encoding = capabilities.position_encoding().as_str(),
            "language server ready"
        );
    }

    fn session_crashed(&self, language: &LanguageId, session: SessionId, error: &SessionError) {
        tracing::error!(
            target: STATUS_TARGET,
            event = "session_crashed",
            %language,
            %session,
            kind = %error.kind(),
            %error,
            "language server crashed"
        );
    }

    fn session_stopped(&self, language: &LanguageId, session: SessionId) {
        tracing::info!(
            target: STATUS_TARGET,
            event = "session_stopped",
            %language,
            %session,
            "language server stopped"
        );
    }
}
