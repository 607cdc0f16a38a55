//! Language Server Protocol client sessions for KIDL.
#![deny(missing_docs)]
//!
//! The crate launches the `kidl-cli lsp` server as a child process, frames
//! JSON-RPC messages over its standard streams, and drives each server
//! through an explicit lifecycle: `Uninitialized → Starting → Initializing →
//! Running → ShuttingDown → Stopped`, or `Crashed` on failure. A
//! [`SessionRegistrar`] owns one [`Session`] per language identifier and
//! creates it on first use.
//!
//! Process launching sits behind the [`ServerLauncher`] and [`ServerProcess`]
//! traits so tests can drive sessions against in-memory servers.

mod capability;
mod config;
mod errors;
pub mod jsonrpc;
mod language;
mod registrar;
mod router;
mod session;
mod status;
pub mod supervisor;
pub mod transport;

pub use capability::NegotiatedCapabilities;
pub use config::{InitializeOptions, SessionConfig};
pub use errors::{SessionError, SessionErrorKind, UnmatchedResponseError};
pub use jsonrpc::{Message, RequestId};
pub use language::{DocumentSelector, LanguageId, LanguageIdError};
pub use registrar::{DeactivationReport, SessionRegistrar};
pub use router::{
    CANCEL_REQUEST_METHOD, CancelHandle, Dispatched, NotificationHandler, PendingResponse, Router,
    SubscriptionId,
};
pub use session::{Session, SessionEvent, SessionId, SessionState};
pub use status::{StatusReporter, TracingStatusReporter};
pub use supervisor::{
    ExitEvent, ExitEvents, LaunchedServer, ProcessLauncher, ServerCommand, ServerLauncher,
    ServerProcess, SpawnError,
};
pub use transport::{FramingError, MessageReader, MessageWriter};

#[cfg(test)]
mod tests;
