//! Editor-facing entry points for the KIDL language client.
//!
//! The editor calls [`activate`] once at startup and [`Extension::deactivate`]
//! at shutdown. Activation loads [`kidl_config::Config`], installs the
//! `tracing` subscriber and prepares a
//! [`SessionRegistrar`](kidl_lsp_client::SessionRegistrar) for the configured
//! language. No server is launched until the first document of that language
//! is opened through the [`ExtensionApi`].

mod activation;
pub mod telemetry;

pub use activation::{
    ActivationError, ApiError, ConfigLoader, Extension, ExtensionApi, StaticConfigLoader,
    SystemConfigLoader, activate, activate_with,
};

#[cfg(test)]
mod tests;
