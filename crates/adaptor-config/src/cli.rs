//! Command-line and environment layer of the configuration.
//!
//! Every flag doubles as an `ADAPTOR_*` environment variable through clap's
//! `env` support, so the two highest-precedence layers share one parser. All
//! values are optional: anything left unset falls through to the file layer
//! and then to the built-in defaults.

use camino::Utf8PathBuf;
use clap::Parser;

use crate::{Config, LOG_FILTER_ENV, LOG_FORMAT_ENV, LogFormat};

/// Flags accepted by the adaptor binaries.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "adaptord", about = "Capability adaptor daemon", version)]
pub struct ConfigArgs {
    /// Path to a TOML configuration file.
    #[arg(long, env = "ADAPTOR_CONFIG_PATH")]
    pub config_path: Option<Utf8PathBuf>,

    /// Tracing filter expression, for example `info,adaptor_plugins=debug`.
    #[arg(long, env = LOG_FILTER_ENV)]
    pub log_filter: Option<String>,

    /// Log output format (`json` or `compact`).
    #[arg(long, env = LOG_FORMAT_ENV)]
    pub log_format: Option<LogFormat>,

    /// Root directory containing one plugin directory per capability.
    #[arg(long, env = "ADAPTOR_PLUGINS_ROOT")]
    pub plugins_root: Option<Utf8PathBuf>,

    /// Executable used to host forked plugins.
    #[arg(long, env = "ADAPTOR_PLUGIN_HOST")]
    pub plugin_host: Option<Utf8PathBuf>,

    /// Deadline for one synchronous plugin call, in milliseconds.
    #[arg(long, env = "ADAPTOR_CALL_TIMEOUT_MS")]
    pub call_timeout_ms: Option<u64>,

    /// Bounded wait of one listener multiplexing pass, in milliseconds.
    #[arg(long, env = "ADAPTOR_LISTENER_WAIT_MS")]
    pub listener_wait_ms: Option<u64>,
}

impl ConfigArgs {
    /// Overlays every value that was supplied on top of `config`.
    pub fn apply(self, config: &mut Config) {
        if let Some(filter) = self.log_filter {
            config.log_filter = filter;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(root) = self.plugins_root {
            config.plugins_root = root;
        }
        if let Some(host) = self.plugin_host {
            config.plugin_host = host;
        }
        if let Some(timeout) = self.call_timeout_ms {
            config.call_timeout_ms = timeout;
        }
        if let Some(wait) = self.listener_wait_ms {
            config.listener_wait_ms = wait;
        }
    }
}
