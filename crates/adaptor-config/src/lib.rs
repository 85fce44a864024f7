//! Shared configuration for the adaptor daemon and its plugin host.
//!
//! Configuration is layered, lowest precedence first: built-in defaults, an
//! optional TOML file, `ADAPTOR_*` environment variables, and command-line
//! flags. [`Config::load`] reads the process arguments; tests and embedders
//! call [`Config::load_from_iter`] with an explicit argument list.
//!
//! ```toml
//! log_filter = "info,adaptor_plugins=debug"
//! log_format = "compact"
//! plugins_root = "/usr/lib/adaptord/plugins"
//! call_timeout_ms = 5000
//!
//! [[forked_plugins]]
//! capability = "auth"
//! package_id = "org.example.auth"
//! path = "/opt/usr/apps/org.example.auth/lib/libauth.so"
//! ```

mod capability;
mod cli;
mod defaults;
mod logging;

use std::ffi::OsString;
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capability::{Capability, CapabilityParseError};
pub use cli::ConfigArgs;
pub use defaults::{
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_LISTENER_WAIT_MS, DEFAULT_LOG_FILTER, DEFAULT_PLUGINS_ROOT,
    PLUGIN_HOST_BINARY, default_log_filter, default_log_filter_string, default_log_format,
    default_plugin_host, default_plugins_root,
};
pub use logging::{LOG_FILTER_ENV, LOG_FORMAT_ENV, LogFormat, LogFormatParseError};

/// A third-party plugin executed in a separate host process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ForkedPluginEntry {
    /// Adaptor the plugin is attached to.
    pub capability: Capability,
    /// Package identifier; doubles as the plugin URI in the registry.
    pub package_id: String,
    /// Plugin library loaded inside the host process.
    pub path: Utf8PathBuf,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Tracing filter expression.
    pub log_filter: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Root directory holding one plugin directory per capability.
    pub plugins_root: Utf8PathBuf,
    /// Executable used to host forked plugins.
    pub plugin_host: Utf8PathBuf,
    /// Deadline for one synchronous plugin call, in milliseconds.
    pub call_timeout_ms: u64,
    /// Bounded wait of one listener multiplexing pass, in milliseconds.
    pub listener_wait_ms: u64,
    /// Third-party plugins started at boot.
    pub forked_plugins: Vec<ForkedPluginEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            plugins_root: default_plugins_root(),
            plugin_host: default_plugin_host(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            listener_wait_ms: DEFAULT_LISTENER_WAIT_MS,
            forked_plugins: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from the process arguments and environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when any layer fails to parse or the merged
    /// result fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_iter(std::env::args_os())
    }

    /// Loads configuration from an explicit argument list.
    ///
    /// The first item is treated as the program name, as with
    /// [`std::env::args_os`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when any layer fails to parse or the merged
    /// result fails validation.
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = ConfigArgs::try_parse_from(args).map_err(|source| ConfigError::Cli {
            source: Arc::new(source),
        })?;
        let mut config = match cli.config_path.as_deref() {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        cli.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file on top of the built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source: Arc::new(source),
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    /// Checks cross-field invariants after all layers are merged.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "log_filter",
                message: String::from("must not be empty"),
            });
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "call_timeout_ms",
                message: String::from("must be greater than zero"),
            });
        }
        if self.listener_wait_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "listener_wait_ms",
                message: String::from("must be greater than zero"),
            });
        }
        if let Some(entry) = self
            .forked_plugins
            .iter()
            .find(|entry| entry.package_id.trim().is_empty())
        {
            return Err(ConfigError::Invalid {
                field: "forked_plugins",
                message: format!("entry for '{}' has an empty package_id", entry.path),
            });
        }
        Ok(())
    }

    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Root directory holding one plugin directory per capability.
    #[must_use]
    pub fn plugins_root(&self) -> &Utf8Path {
        self.plugins_root.as_path()
    }

    /// Plugin directory scanned for the given capability.
    #[must_use]
    pub fn plugin_dir(&self, capability: Capability) -> Utf8PathBuf {
        self.plugins_root.join(capability.directory_name())
    }

    /// Executable used to host forked plugins.
    #[must_use]
    pub fn plugin_host(&self) -> &Utf8Path {
        self.plugin_host.as_path()
    }

    /// Deadline for one synchronous plugin call.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Bounded wait of one listener multiplexing pass.
    #[must_use]
    pub const fn listener_wait(&self) -> Duration {
        Duration::from_millis(self.listener_wait_ms)
    }

    /// Third-party plugins attached to the given capability.
    pub fn forked_plugins_for(
        &self,
        capability: Capability,
    ) -> impl Iterator<Item = &ForkedPluginEntry> {
        self.forked_plugins
            .iter()
            .filter(move |entry| entry.capability == capability)
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Command-line or environment values were rejected.
    #[error("invalid command-line or environment configuration: {source}")]
    Cli {
        /// Underlying clap error; also carries `--help` and `--version` output.
        #[source]
        source: Arc<clap::Error>,
    },
    /// The configuration file could not be read.
    #[error("failed to read configuration file '{path}': {source}")]
    Read {
        /// File that was requested.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The configuration file is not valid TOML for [`Config`].
    #[error("failed to parse configuration file '{path}': {source}")]
    Parse {
        /// File that was parsed.
        path: Utf8PathBuf,
        /// Underlying TOML error.
        #[source]
        source: Box<toml::de::Error>,
    },
    /// A merged value failed validation.
    #[error("invalid value for '{field}': {message}")]
    Invalid {
        /// Field name as spelled in the configuration file.
        field: &'static str,
        /// Description of the violation.
        message: String,
    },
}

impl ConfigError {
    /// Returns `true` when clap asked to print help or version text rather
    /// than reporting a failure.
    #[must_use]
    pub fn is_informational(&self) -> bool {
        match self {
            Self::Cli { source } => matches!(
                source.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ),
            Self::Read { .. } | Self::Parse { .. } | Self::Invalid { .. } => false,
        }
    }
}
