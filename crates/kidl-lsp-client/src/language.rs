//! Language identifiers and document routing.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Tag that routes a document to a session, such as `kidl`.
///
/// Identifiers are trimmed and lower-cased on construction so `KIDL` and
/// `kidl` route to the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LanguageId(String);

impl LanguageId {
    /// Builds an identifier, rejecting blank input.
    ///
    /// # Errors
    ///
    /// Returns [`LanguageIdError`] when `input` is empty after trimming.
    pub fn new(input: impl AsRef<str>) -> Result<Self, LanguageIdError> {
        let normalised = input.as_ref().trim().to_ascii_lowercase();
        if normalised.is_empty() {
            return Err(LanguageIdError(input.as_ref().to_owned()));
        }
        Ok(Self(normalised))
    }

    /// Returns the normalised identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for LanguageId {
    type Err = LanguageIdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::new(input)
    }
}

/// Error raised for blank language identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid language identifier '{0}'")]
pub struct LanguageIdError(String);

impl LanguageIdError {
    /// Returns the input that failed to parse.
    #[must_use]
    pub fn input(&self) -> &str {
        self.0.as_str()
    }
}

/// Set of language identifiers the client accepts documents for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSelector {
    languages: Vec<LanguageId>,
}

impl DocumentSelector {
    /// Selector matching a single language.
    #[must_use]
    pub fn language(language: LanguageId) -> Self {
        Self {
            languages: vec![language],
        }
    }

    /// Adds another language to the selector.
    #[must_use]
    pub fn with_language(mut self, language: LanguageId) -> Self {
        if !self.languages.contains(&language) {
            self.languages.push(language);
        }
        self
    }

    /// Whether documents of `language` are routed to a session.
    #[must_use]
    pub fn matches(&self, language: &LanguageId) -> bool {
        self.languages.contains(language)
    }

    /// Languages accepted by the selector.
    pub fn languages(&self) -> impl Iterator<Item = &LanguageId> {
        self.languages.iter()
    }
}
