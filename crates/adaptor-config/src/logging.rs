//! Log settings shared by the daemon and its plugin hosts.
//!
//! A forked plugin host inherits the daemon's environment and stderr, so
//! both processes read the same variables and their lines land in one
//! stream in one shape.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Variable holding the tracing filter expression.
pub const LOG_FILTER_ENV: &str = "ADAPTOR_LOG_FILTER";

/// Variable holding the [`LogFormat`] name.
pub const LOG_FORMAT_ENV: &str = "ADAPTOR_LOG_FORMAT";

/// Shape of each log line on stderr.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One flattened JSON object per event, with the thread name.
    #[default]
    Json,
    /// Plain text for a terminal.
    Compact,
}

/// Rejection of a [`LogFormat`] name other than `json` or `compact`.
pub type LogFormatParseError = strum::ParseError;
