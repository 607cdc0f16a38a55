//! Extension activation and deactivation.

use std::sync::{Arc, Weak};

use lsp_types::{DidChangeTextDocumentParams, DidCloseTextDocumentParams, TextDocumentItem};
use ortho_config::OrthoError;
use thiserror::Error;
use tracing::{error, info, warn};

use kidl_config::Config;
use kidl_lsp_client::{
    DeactivationReport, DocumentSelector, LanguageId, LanguageIdError, ProcessLauncher,
    ServerCommand, ServerLauncher, Session, SessionConfig, SessionError, SessionRegistrar,
    StatusReporter, TracingStatusReporter,
};

use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Log target for activation events.
pub(crate) const ACTIVATION_TARGET: &str = "kidl_extension::activation";

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the client configuration.
    ///
    /// # Errors
    ///
    /// Returns the `ortho_config` error when any configuration layer is invalid.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader returning a fixed configuration, for embedders that resolve
/// settings themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps `config`.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during activation.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The configured language identifier is unusable.
    #[error("invalid language identifier: {source}")]
    Language {
        /// Underlying validation error.
        #[source]
        source: LanguageIdError,
    },
}

/// Errors returned by [`ExtensionApi`] calls.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The extension has been deactivated.
    #[error("the extension has been deactivated")]
    Deactivated,
    /// The session layer rejected the call.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// An activated extension.
///
/// Owns the session registrar. Call [`Extension::deactivate`] at shutdown so
/// servers receive `shutdown` and `exit` before the editor goes away.
pub struct Extension {
    config: Config,
    language: LanguageId,
    telemetry: TelemetryHandle,
    registrar: Arc<SessionRegistrar>,
}

impl Extension {
    /// Accessor for the resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Language identifier served by this extension.
    #[must_use]
    pub const fn language(&self) -> &LanguageId {
        &self.language
    }

    /// Accessor for the telemetry handle, primarily useful for testing.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Handle exposed to editor code and other extensions.
    #[must_use]
    pub fn api(&self) -> ExtensionApi {
        ExtensionApi {
            language: self.language.clone(),
            registrar: Arc::downgrade(&self.registrar),
        }
    }

    /// Shuts every session down, bounded by `deactivate_timeout_ms`.
    ///
    /// API handles obtained earlier report [`ApiError::Deactivated`]
    /// afterwards.
    #[must_use = "the report names sessions that had to be killed"]
    pub fn deactivate(self) -> DeactivationReport {
        let timeout = self.config.deactivate_timeout();
        info!(
            target: ACTIVATION_TARGET,
            language = %self.language,
            timeout_ms = timeout.as_millis(),
            "deactivating extension"
        );
        let report = self.registrar.deactivate_all(timeout);
        if report.is_clean() {
            info!(
                target: ACTIVATION_TARGET,
                stopped = report.stopped.len(),
                "extension deactivated"
            );
        } else {
            warn!(
                target: ACTIVATION_TARGET,
                stopped = report.stopped.len(),
                forced = ?report.forced,
                "extension deactivated after forcing servers down"
            );
        }
        report
    }
}

/// Cloneable handle onto an activated extension's sessions.
///
/// The handle does not keep the extension alive; once it has been
/// deactivated every call fails with [`ApiError::Deactivated`].
#[derive(Clone)]
pub struct ExtensionApi {
    language: LanguageId,
    registrar: Weak<SessionRegistrar>,
}

impl ExtensionApi {
    /// Language identifier served by the extension.
    #[must_use]
    pub const fn language(&self) -> &LanguageId {
        &self.language
    }

    /// Whether the extension is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.registrar.strong_count() > 0
    }

    /// Current session for the extension's language, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Deactivated`] after deactivation.
    pub fn session(&self) -> Result<Option<Session>, ApiError> {
        Ok(self.registrar()?.session(&self.language))
    }

    /// All current sessions.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Deactivated`] after deactivation.
    pub fn sessions(&self) -> Result<Vec<Session>, ApiError> {
        Ok(self.registrar()?.sessions())
    }

    /// Returns the running session, starting a server when needed.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Session`] when the server cannot be started.
    pub fn ensure_session(&self) -> Result<Session, ApiError> {
        Ok(self.registrar()?.resolve_session(&self.language)?)
    }

    /// Replaces the current session with a freshly started one.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Session`] when the new server cannot be started.
    pub fn restart(&self) -> Result<Session, ApiError> {
        let registrar = self.registrar()?;
        info!(
            target: ACTIVATION_TARGET,
            language = %self.language,
            "restarting language server on request"
        );
        Ok(registrar.restart(&self.language)?)
    }

    /// Routes an opened document to its session.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Session`] when the document's language is not
    /// served or its server cannot be started.
    pub fn open_document(&self, document: TextDocumentItem) -> Result<Session, ApiError> {
        Ok(self.registrar()?.open_document(document)?)
    }

    /// Forwards a document change; returns `false` when no session is running.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Session`] when the notification cannot be written.
    pub fn change_document(&self, params: DidChangeTextDocumentParams) -> Result<bool, ApiError> {
        Ok(self.registrar()?.change_document(&self.language, params)?)
    }

    /// Forwards a document close; returns `false` when no session is running.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Session`] when the notification cannot be written.
    pub fn close_document(&self, params: DidCloseTextDocumentParams) -> Result<bool, ApiError> {
        Ok(self.registrar()?.close_document(&self.language, params)?)
    }

    fn registrar(&self) -> Result<Arc<SessionRegistrar>, ApiError> {
        self.registrar.upgrade().ok_or(ApiError::Deactivated)
    }
}

/// Activates the extension from the process configuration.
///
/// No language server is started here; the first document of the configured
/// language starts one.
///
/// # Errors
///
/// Returns [`ActivationError`] when configuration, telemetry or the language
/// identifier is invalid.
pub fn activate() -> Result<Extension, ActivationError> {
    activate_with(
        &SystemConfigLoader,
        Arc::new(TracingStatusReporter::new()),
        process_launcher,
    )
}

/// Activates the extension using the supplied collaborators.
///
/// `launcher` builds the server launcher once configuration and language are
/// known.
///
/// # Errors
///
/// Returns [`ActivationError`] when configuration, telemetry or the language
/// identifier is invalid.
pub fn activate_with<F>(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn StatusReporter>,
    launcher: F,
) -> Result<Extension, ActivationError>
where
    F: FnOnce(&Config, &LanguageId) -> Arc<dyn ServerLauncher>,
{
    let config = loader
        .load()
        .map_err(|source| ActivationError::Configuration { source })
        .inspect_err(report_failure)?;
    let telemetry = telemetry::initialise(&config)
        .map_err(|source| ActivationError::Telemetry { source })
        .inspect_err(report_failure)?;
    let language = LanguageId::new(config.language_id())
        .map_err(|source| ActivationError::Language { source })
        .inspect_err(report_failure)?;

    let registrar = SessionRegistrar::new(
        DocumentSelector::language(language.clone()),
        launcher(&config, &language),
    )
    .with_session_config(SessionConfig::from_config(&config))
    .with_reporter(reporter);

    info!(
        target: ACTIVATION_TARGET,
        %language,
        log_format = %config.log_format(),
        "extension activated"
    );
    Ok(Extension {
        config,
        language,
        telemetry,
        registrar: Arc::new(registrar),
    })
}

pub(crate) fn process_launcher(config: &Config, language: &LanguageId) -> Arc<dyn ServerLauncher> {
    Arc::new(
        ProcessLauncher::new().with_command(language.clone(), ServerCommand::from_config(config)),
    )
}

fn report_failure(failure: &ActivationError) {
    error!(target: ACTIVATION_TARGET, error = %failure, "activation failed");
}
