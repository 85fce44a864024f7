//! Log output of the daemon process.
//!
//! Adaptor, listener, and broker events all go to stderr. Forked plugin
//! hosts inherit that stream and install their own subscriber, so every
//! line carries its thread name: the per-plugin writer threads and the
//! per-capability listener threads are named after what they serve.

use std::io::{self, IsTerminal};

use adaptor_config::{Config, LogFormat};
use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

static INSTALLED_FORMAT: OnceCell<LogFormat> = OnceCell::new();

/// Proof that the daemon subscriber is installed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryHandle {
    format: LogFormat,
}

impl TelemetryHandle {
    /// Format chosen by whichever configuration installed the subscriber.
    #[must_use]
    pub const fn format(self) -> LogFormat {
        self.format
    }
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// `log_filter` is not a valid `EnvFilter` directive list.
    #[error("log filter '{expression}' is invalid: {reason}")]
    Filter {
        /// Expression as configured.
        expression: String,
        /// Parser message.
        reason: String,
    },
    /// Something other than the daemon installed a global subscriber first.
    #[error("another tracing subscriber is already installed: {0}")]
    Subscriber(#[source] SetGlobalDefaultError),
}

/// Installs the daemon subscriber on first use.
///
/// Only the first configuration counts. Bootstrapping twice in one
/// process, as the daemon tests do, returns a handle reporting the format
/// already in use.
///
/// # Errors
///
/// Returns a [`TelemetryError`] when the first installation fails.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    INSTALLED_FORMAT
        .get_or_try_init(|| install(config))
        .map(|format| TelemetryHandle { format: *format })
}

fn install(config: &Config) -> Result<LogFormat, TelemetryError> {
    let format = config.log_format();
    let subscriber = stderr_subscriber(format, parse_filter(config.log_filter())?);
    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)?;
    Ok(format)
}

pub(crate) fn parse_filter(expression: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(expression).map_err(|error| TelemetryError::Filter {
        expression: expression.to_owned(),
        reason: error.to_string(),
    })
}

fn stderr_subscriber(format: LogFormat, filter: EnvFilter) -> Box<dyn Subscriber + Send + Sync> {
    let lines = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_thread_names(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    match format {
        LogFormat::Json => Box::new(lines.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(lines.compact().finish()),
    }
}
