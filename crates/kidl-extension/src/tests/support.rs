//! Shared fixtures for extension tests.

use std::str::FromStr;
use std::sync::Arc;

use kidl_config::Config;
use kidl_lsp_client::{LanguageId, LaunchedServer, ServerLauncher, SpawnError};
use lsp_types::{TextDocumentItem, Uri};
use mockall::mock;
use ortho_config::OrthoError;

use crate::ConfigLoader;

mock! {
    pub Loader {}
    impl ConfigLoader for Loader {
        fn load(&self) -> Result<Config, Arc<OrthoError>>;
    }
}

mock! {
    pub Launcher {}
    impl ServerLauncher for Launcher {
        fn launch(&self, language: &LanguageId) -> Result<LaunchedServer, SpawnError>;
    }
}

/// Loader expected to be consulted exactly once.
pub fn loader_returning(config: Config) -> MockLoader {
    let mut loader = MockLoader::new();
    loader
        .expect_load()
        .times(1)
        .returning(move || Ok(config.clone()));
    loader
}

/// Launcher that refuses every launch, as if no command were registered.
pub fn refusing_launcher(expected_launches: usize) -> MockLauncher {
    let mut launcher = MockLauncher::new();
    launcher
        .expect_launch()
        .times(expected_launches)
        .returning(|language| {
            Err(SpawnError::NoCommand {
                language: language.clone(),
            })
        });
    launcher
}

/// Opened document with the given language identifier.
pub fn document(name: &str, language: &str) -> TextDocumentItem {
    TextDocumentItem {
        uri: Uri::from_str(&format!("file:///workspace/{name}")).expect("valid uri"),
        language_id: language.to_owned(),
        version: 1,
        text: "schema Example {}\n".to_owned(),
    }
}
