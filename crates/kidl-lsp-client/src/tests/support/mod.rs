//! Shared fixtures for session and registrar tests.

mod fake_server;
mod reporter;

use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lsp_types::{TextDocumentItem, Uri};
use rstest::fixture;

use crate::config::{InitializeOptions, SessionConfig};
use crate::language::{DocumentSelector, LanguageId};
use crate::registrar::SessionRegistrar;
use crate::session::Session;

pub use fake_server::{FakeLauncher, FakeServer, KILLED, ServerScript, TERMINATED};
pub use reporter::{RecordingReporter, StatusEvent};

/// The `kidl` identifier.
#[fixture]
pub fn kidl() -> LanguageId {
    LanguageId::new("kidl").expect("valid language id")
}

/// Timeouts short enough for tests yet long enough for slow CI hosts.
#[fixture]
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        initialize_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_millis(500),
        grace_timeout: Duration::from_millis(500),
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses.
pub fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Session started and initialised against `launcher`.
pub fn running_session(
    launcher: &FakeLauncher,
    config: SessionConfig,
    reporter: Arc<RecordingReporter>,
) -> Session {
    let session = Session::new(kidl(), config, reporter);
    session.start(launcher).expect("session starts");
    session
        .initialize(&InitializeOptions::default())
        .expect("handshake succeeds");
    session
}

/// Registrar serving `languages` through `launcher`.
pub fn registrar(
    languages: &[&str],
    launcher: Arc<FakeLauncher>,
    reporter: Arc<RecordingReporter>,
) -> SessionRegistrar {
    let mut ids = languages
        .iter()
        .map(|language| LanguageId::new(language).expect("valid language id"));
    let first = ids.next().expect("at least one language");
    let selector = ids.fold(DocumentSelector::language(first), DocumentSelector::with_language);
    SessionRegistrar::new(selector, launcher)
        .with_session_config(fast_config())
        .with_reporter(reporter)
}

/// A document of `language` at `file:///workspace/<name>`.
pub fn document(name: &str, language: &str) -> TextDocumentItem {
    TextDocumentItem {
        uri: Uri::from_str(&format!("file:///workspace/{name}")).expect("valid uri"),
        language_id: language.to_owned(),
        version: 1,
        text: "schema Example {}\n".to_owned(),
    }
}
