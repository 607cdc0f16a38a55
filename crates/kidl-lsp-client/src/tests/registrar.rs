//! Registrar routing, recovery and deactivation tests.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, TextDocumentContentChangeEvent,
    TextDocumentIdentifier, VersionedTextDocumentIdentifier,
};
use rstest::rstest;

use crate::errors::SessionErrorKind;
use crate::language::LanguageId;
use crate::registrar::DeactivationReport;
use crate::session::SessionState;
use crate::tests::support::{
    FakeLauncher, RecordingReporter, ServerScript, StatusEvent, document, eventually, kidl,
    registrar,
};

const SETTLE: Duration = Duration::from_secs(2);

fn language(name: &str) -> LanguageId {
    LanguageId::new(name).expect("valid language id")
}

fn change_params(name: &str) -> DidChangeTextDocumentParams {
    DidChangeTextDocumentParams {
        text_document: VersionedTextDocumentIdentifier {
            uri: document(name, "kidl").uri,
            version: 2,
        },
        content_changes: vec![TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: "schema Renamed {}\n".to_owned(),
        }],
    }
}

fn close_params(name: &str) -> DidCloseTextDocumentParams {
    DidCloseTextDocumentParams {
        text_document: TextDocumentIdentifier {
            uri: document(name, "kidl").uri,
        },
    }
}

#[rstest]
fn same_language_resolves_to_the_same_session() {
    let launcher = Arc::new(FakeLauncher::default());
    let registry = registrar(&["kidl"], Arc::clone(&launcher), Arc::default());

    let first = registry.resolve_session(&kidl()).expect("session starts");
    let second = registry.resolve_session(&kidl()).expect("session reused");

    assert!(first.ptr_eq(&second));
    assert_eq!(first.state(), SessionState::Running);
    assert_eq!(launcher.attempts(), 1);
}

#[rstest]
fn different_languages_get_distinct_sessions_and_processes() {
    let launcher = Arc::new(FakeLauncher::default());
    let registry = registrar(&["kidl", "kidl-test"], Arc::clone(&launcher), Arc::default());

    let kidl_session = registry.resolve_session(&kidl()).expect("kidl session");
    let test_session = registry
        .resolve_session(&language("kidl-test"))
        .expect("kidl-test session");

    assert!(!kidl_session.ptr_eq(&test_session));
    assert_ne!(kidl_session.pid(), test_session.pid());
    assert_eq!(launcher.attempts(), 2);
    let languages: Vec<_> = registry
        .sessions()
        .iter()
        .map(|session| session.language().clone())
        .collect();
    assert_eq!(languages, vec![kidl(), language("kidl-test")]);
}

#[rstest]
fn concurrent_resolution_launches_one_server() {
    let launcher = Arc::new(FakeLauncher::default());
    let registry = Arc::new(registrar(&["kidl"], Arc::clone(&launcher), Arc::default()));
    let barrier = Arc::new(Barrier::new(6));

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let shared = Arc::clone(&registry);
            let gate = Arc::clone(&barrier);
            thread::spawn(move || {
                gate.wait();
                shared.resolve_session(&kidl()).expect("session resolves")
            })
        })
        .collect();
    let sessions: Vec<_> = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker finished"))
        .collect();

    assert_eq!(launcher.attempts(), 1);
    let first = sessions.first().expect("at least one session");
    assert!(sessions.iter().all(|session| session.ptr_eq(first)));
}

#[rstest]
fn unselected_languages_are_rejected() {
    let launcher = Arc::new(FakeLauncher::default());
    let registry = registrar(&["kidl"], Arc::clone(&launcher), Arc::default());

    let error = registry
        .resolve_session(&language("rust"))
        .expect_err("rust is not served");

    assert_eq!(error.kind(), SessionErrorKind::UnsupportedLanguage);
    assert_eq!(launcher.attempts(), 0);
}

#[rstest]
fn crashed_sessions_are_replaced_on_next_use() {
    let launcher = Arc::new(FakeLauncher::default());
    let reporter = Arc::new(RecordingReporter::default());
    let registry = registrar(&["kidl"], Arc::clone(&launcher), Arc::clone(&reporter));
    let original = registry.resolve_session(&kidl()).expect("session starts");

    launcher.last().crash(1);
    assert!(eventually(SETTLE, || original.state() == SessionState::Crashed));

    let replacement = registry.resolve_session(&kidl()).expect("session restarts");
    assert!(!replacement.ptr_eq(&original));
    assert_ne!(replacement.id(), original.id());
    assert_eq!(replacement.state(), SessionState::Running);
    assert_eq!(launcher.attempts(), 2);
    assert_eq!(reporter.crashes(original.id()), 1);
}

#[rstest]
fn spawn_failures_are_not_retried_until_restart() {
    let launcher = Arc::new(FakeLauncher::missing_executable());
    let reporter = Arc::new(RecordingReporter::default());
    let registry = registrar(&["kidl"], Arc::clone(&launcher), Arc::clone(&reporter));

    let first = registry
        .resolve_session(&kidl())
        .expect_err("executable is missing");
    let second = registry
        .resolve_session(&kidl())
        .expect_err("failure is remembered");

    assert_eq!(first.kind(), SessionErrorKind::Spawn);
    assert_eq!(second.kind(), SessionErrorKind::Spawn);
    assert_eq!(launcher.attempts(), 1);
    let crashed = reporter
        .events()
        .into_iter()
        .filter(|event| matches!(event, StatusEvent::Crashed(..)))
        .count();
    assert_eq!(crashed, 1);

    let retried = registry
        .restart(&kidl())
        .expect_err("restart retries the launch");
    assert_eq!(retried.kind(), SessionErrorKind::Spawn);
    assert_eq!(launcher.attempts(), 2);
}

#[rstest]
fn restart_replaces_a_running_session() {
    let launcher = Arc::new(FakeLauncher::default());
    let registry = registrar(&["kidl"], Arc::clone(&launcher), Arc::default());
    let original = registry.resolve_session(&kidl()).expect("session starts");

    let replacement = registry.restart(&kidl()).expect("session restarts");

    assert_eq!(original.state(), SessionState::Stopped);
    assert_eq!(replacement.state(), SessionState::Running);
    assert!(
        registry
            .session(&kidl())
            .is_some_and(|current| current.ptr_eq(&replacement))
    );
}

#[rstest]
fn opening_a_document_starts_its_session() {
    let launcher = Arc::new(FakeLauncher::default());
    let registry = registrar(&["kidl"], Arc::clone(&launcher), Arc::default());
    assert!(registry.session(&kidl()).is_none());

    let session = registry
        .open_document(document("main.kidl", "KIDL"))
        .expect("document opens");

    assert_eq!(session.state(), SessionState::Running);
    let server = launcher.last();
    assert!(eventually(SETTLE, || {
        !server.notifications("textDocument/didOpen").is_empty()
    }));
    let opened = server
        .notifications("textDocument/didOpen")
        .pop()
        .and_then(|notification| notification.params)
        .expect("didOpen params");
    assert_eq!(
        opened.pointer("/textDocument/uri").and_then(|uri| uri.as_str()),
        Some("file:///workspace/main.kidl")
    );
}

#[rstest]
#[case::other_language("rust")]
#[case::blank("  ")]
fn documents_of_other_languages_are_rejected(#[case] language_id: &str) {
    let launcher = Arc::new(FakeLauncher::default());
    let registry = registrar(&["kidl"], Arc::clone(&launcher), Arc::default());

    let error = registry
        .open_document(document("main.rs", language_id))
        .expect_err("document is not routed");

    assert_eq!(error.kind(), SessionErrorKind::UnsupportedLanguage);
    assert_eq!(launcher.attempts(), 0);
}

#[rstest]
fn change_and_close_reach_only_running_sessions() {
    let launcher = Arc::new(FakeLauncher::default());
    let registry = registrar(&["kidl"], Arc::clone(&launcher), Arc::default());

    assert!(
        !registry
            .change_document(&kidl(), change_params("main.kidl"))
            .expect("no session is not an error")
    );
    assert_eq!(launcher.attempts(), 0);

    registry
        .open_document(document("main.kidl", "kidl"))
        .expect("document opens");
    assert!(
        registry
            .change_document(&kidl(), change_params("main.kidl"))
            .expect("change delivered")
    );
    assert!(
        registry
            .close_document(&kidl(), close_params("main.kidl"))
            .expect("close delivered")
    );

    let server = launcher.last();
    assert!(eventually(SETTLE, || {
        server.received_methods().ends_with(&[
            "textDocument/didOpen".to_owned(),
            "textDocument/didChange".to_owned(),
            "textDocument/didClose".to_owned(),
        ])
    }));
}

#[rstest]
fn deactivate_all_stops_every_session() {
    let launcher = Arc::new(FakeLauncher::default());
    let reporter = Arc::new(RecordingReporter::default());
    let registry = registrar(&["kidl", "kidl-test"], Arc::clone(&launcher), Arc::clone(&reporter));
    let kidl_session = registry.resolve_session(&kidl()).expect("kidl session");
    let test_session = registry
        .resolve_session(&language("kidl-test"))
        .expect("kidl-test session");

    let report = registry.deactivate_all(SETTLE);

    assert_eq!(
        report,
        DeactivationReport {
            stopped: vec![kidl(), language("kidl-test")],
            forced: Vec::new(),
        }
    );
    assert!(report.is_clean());
    assert_eq!(kidl_session.state(), SessionState::Stopped);
    assert_eq!(test_session.state(), SessionState::Stopped);
    assert!(registry.sessions().is_empty());
    for server in launcher.servers() {
        assert!(server.received_methods().ends_with(&["shutdown".to_owned(), "exit".to_owned()]));
    }
}

#[rstest]
fn deactivate_all_forces_sessions_past_the_deadline() {
    let launcher = Arc::new(FakeLauncher::new(ServerScript::stubborn()));
    let reporter = Arc::new(RecordingReporter::default());
    let registry = registrar(&["kidl"], Arc::clone(&launcher), Arc::clone(&reporter));
    let session = registry.resolve_session(&kidl()).expect("session starts");

    let started = Instant::now();
    let report = registry.deactivate_all(Duration::from_millis(100));

    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(report.forced, vec![kidl()]);
    assert!(!report.is_clean());
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(launcher.last().terminations().contains(&Duration::ZERO));
    assert!(eventually(SETTLE, || {
        reporter
            .events_for(session.id())
            .iter()
            .filter(|event| matches!(event, StatusEvent::Stopped(_)))
            .count()
            == 1
    }));
}

#[rstest]
fn deactivate_all_skips_crashed_sessions() {
    let launcher = Arc::new(FakeLauncher::default());
    let registry = registrar(&["kidl"], Arc::clone(&launcher), Arc::default());
    let session = registry.resolve_session(&kidl()).expect("session starts");
    launcher.last().crash(1);
    assert!(eventually(SETTLE, || session.state() == SessionState::Crashed));

    let report = registry.deactivate_all(SETTLE);

    assert_eq!(report, DeactivationReport::default());
    assert_eq!(session.state(), SessionState::Crashed);
}

#[rstest]
fn deactivate_all_reaches_sessions_mid_handshake() {
    let launcher = Arc::new(FakeLauncher::new(ServerScript::silent()));
    let registry = Arc::new(registrar(&["kidl"], Arc::clone(&launcher), Arc::default()));
    let resolver = {
        let shared = Arc::clone(&registry);
        thread::spawn(move || shared.resolve_session(&kidl()))
    };
    assert!(eventually(SETTLE, || {
        registry
            .session(&kidl())
            .is_some_and(|session| session.state() == SessionState::Initializing)
    }));
    let session = registry.session(&kidl()).expect("handshake in progress");

    let started = Instant::now();
    let report = registry.deactivate_all(Duration::from_millis(300));

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.stopped.len() + report.forced.len(), 1);
    assert_eq!(session.state(), SessionState::Stopped);
    let interrupted = resolver
        .join()
        .expect("resolver finished")
        .expect_err("handshake was interrupted");
    assert_eq!(interrupted.kind(), SessionErrorKind::Cancelled);
    assert!(registry.sessions().is_empty());
}
