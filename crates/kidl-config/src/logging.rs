use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Output formats understood by the client's telemetry subscriber.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per event, for editors that capture structured output.
    #[default]
    Json,
    /// Terse single-line text.
    Compact,
    /// Multi-line human-oriented text, useful when debugging a server by hand.
    Pretty,
}

/// Error raised when a [`LogFormat`] cannot be parsed from text.
pub type LogFormatParseError = strum::ParseError;
