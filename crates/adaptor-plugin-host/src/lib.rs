//! Host process for forked-tier plugins.
//!
//! The adaptor daemon starts one host per third-party plugin. The host loads
//! the plugin library through the in-process ABI, checks that it is the
//! plugin the daemon asked for, and then answers framed requests on stdin
//! with framed replies on stdout until the daemon closes the pipe. Logs go to
//! stderr, which the daemon leaves attached to its own log sink.

#[cfg(test)]
mod tests;

use std::ffi::OsString;
use std::io::{self, Read, Write};

use adaptor_config::{Capability, DEFAULT_LOG_FILTER, LOG_FILTER_ENV, LOG_FORMAT_ENV, LogFormat};
use adaptor_plugins::{AdaptorError, FramingError, LibraryBackend, run_collector};
use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

const HOST_TARGET: &str = "adaptor_plugin_host";

/// Command line accepted by the host.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(
    name = "adaptor-plugin-host",
    version,
    about = "Runs one adaptor plugin behind a pipe"
)]
pub struct HostArgs {
    /// Capability the plugin must serve.
    #[arg(long)]
    pub capability: Capability,
    /// Package identifier the plugin must register as.
    #[arg(long = "package", value_name = "ID")]
    pub package_id: String,
    /// Tracing filter for the host's stderr log.
    #[arg(long, env = LOG_FILTER_ENV, default_value = DEFAULT_LOG_FILTER)]
    pub log_filter: String,
    /// Shape of the host's stderr log, matching the daemon's by default.
    #[arg(long, env = LOG_FORMAT_ENV, default_value_t = LogFormat::default())]
    pub log_format: LogFormat,
    /// Plugin library to load.
    #[arg(value_name = "PLUGIN")]
    pub path: Utf8PathBuf,
}

/// Reasons the host exits early.
#[derive(Debug, Error)]
pub enum HostError {
    /// The command line was rejected.
    #[error(transparent)]
    Args(#[from] clap::Error),
    /// The log filter did not parse.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// The global subscriber could not be installed.
    #[error("failed to install log subscriber: {0}")]
    Subscriber(#[source] SetGlobalDefaultError),
    /// The plugin library could not be loaded.
    #[error("failed to load plugin '{path}': {source}")]
    Load {
        /// Library path.
        path: Utf8PathBuf,
        /// Loader error.
        #[source]
        source: AdaptorError,
    },
    /// The plugin serves another capability.
    #[error("plugin '{path}' serves {found}, expected {expected}")]
    CapabilityMismatch {
        /// Library path.
        path: Utf8PathBuf,
        /// Capability requested by the daemon.
        expected: Capability,
        /// Capability reported by the plugin.
        found: Capability,
    },
    /// The plugin registers under another URI.
    #[error("plugin '{path}' registers as '{found}', expected package '{expected}'")]
    PackageMismatch {
        /// Library path.
        path: Utf8PathBuf,
        /// Package requested by the daemon.
        expected: String,
        /// URI reported by the plugin.
        found: String,
    },
    /// The channel to the daemon failed.
    #[error("plugin channel failed: {0}")]
    Channel(#[from] FramingError),
}

impl HostError {
    /// Process exit status for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Args(_) | Self::Filter(_) => 2,
            Self::Subscriber(_) => 1,
            Self::Load { .. } | Self::CapabilityMismatch { .. } | Self::PackageMismatch { .. } => 3,
            Self::Channel(_) => 4,
        }
    }
}

/// Parses the host command line.
///
/// # Errors
///
/// Returns [`HostError::Args`] for unknown flags, missing values, or the
/// help and version requests clap reports as errors.
pub fn parse_args<I, T>(args: I) -> Result<HostArgs, HostError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Ok(HostArgs::try_parse_from(args)?)
}

/// Installs a subscriber writing to stderr in `format`.
///
/// Stdout carries the plugin protocol and never receives log text.
///
/// # Errors
///
/// Returns [`HostError::Filter`] for a malformed filter and
/// [`HostError::Subscriber`] when a global subscriber already exists.
pub fn init_logging(filter: &str, format: LogFormat) -> Result<(), HostError> {
    let env_filter =
        EnvFilter::try_new(filter).map_err(|error| HostError::Filter(error.to_string()))?;
    let lines = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    let installed = match format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(lines.json().flatten_event(true).finish())
        }
        LogFormat::Compact => tracing::subscriber::set_global_default(lines.compact().finish()),
    };
    installed.map_err(HostError::Subscriber)
}

/// Loads the plugin named by `args` and checks its identity.
///
/// # Errors
///
/// Returns [`HostError::Load`] when the library cannot be loaded, and a
/// mismatch error when it is not the plugin the daemon asked for.
pub fn load(args: &HostArgs) -> Result<LibraryBackend, HostError> {
    let backend = LibraryBackend::load(&args.path).map_err(|source| HostError::Load {
        path: args.path.clone(),
        source,
    })?;
    verify(args, &backend)?;
    Ok(backend)
}

/// Checks that `backend` serves the requested capability and package.
///
/// # Errors
///
/// Returns [`HostError::CapabilityMismatch`] or
/// [`HostError::PackageMismatch`].
pub fn verify(args: &HostArgs, backend: &LibraryBackend) -> Result<(), HostError> {
    if backend.capability() != args.capability {
        return Err(HostError::CapabilityMismatch {
            path: args.path.clone(),
            expected: args.capability,
            found: backend.capability(),
        });
    }
    if backend.uri() != args.package_id {
        return Err(HostError::PackageMismatch {
            path: args.path.clone(),
            expected: args.package_id.clone(),
            found: backend.uri().to_owned(),
        });
    }
    Ok(())
}

/// Answers requests until the daemon disconnects.
///
/// Returns the number of replies written.
///
/// # Errors
///
/// Returns [`HostError::Channel`] when the pipe breaks or carries a corrupt
/// frame.
pub fn serve<R, W>(
    backend: &mut LibraryBackend,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64, HostError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    info!(
        target: HOST_TARGET,
        plugin = backend.uri(),
        capability = %backend.capability(),
        "serving plugin requests"
    );
    run_collector(reader, writer, backend).map_err(|source| {
        error!(
            target: HOST_TARGET,
            plugin = backend.uri(),
            error = %source,
            "plugin channel failed"
        );
        HostError::from(source)
    })
}

/// Loads the plugin and serves it on `reader` and `writer`.
///
/// # Errors
///
/// Returns the first [`HostError`] raised while loading or serving.
pub fn run<R, W>(args: &HostArgs, reader: &mut R, writer: &mut W) -> Result<u64, HostError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut backend = load(args)?;
    serve(&mut backend, reader, writer)
}
