use std::env;

use camino::Utf8PathBuf;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default deadline for one synchronous plugin call.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;

/// Default bounded wait of one plugin listener multiplexing pass.
pub const DEFAULT_LISTENER_WAIT_MS: u64 = 10_000;

/// Directory scanned for in-process plugin libraries when nothing else is
/// configured. Each capability reads its own sub-directory.
pub const DEFAULT_PLUGINS_ROOT: &str = "/usr/lib/adaptord/plugins";

/// File name of the forked-plugin host executable.
pub const PLUGIN_HOST_BINARY: &str = "adaptor-plugin-host";

const FALLBACK_PLUGIN_HOST: &str = "/usr/libexec/adaptor-plugin-host";

/// Default log filter expression used by the binaries.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
#[must_use]
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}

/// Default root of the per-capability plugin directories.
#[must_use]
pub fn default_plugins_root() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_PLUGINS_ROOT)
}

/// Locates the plugin host next to the running executable.
///
/// Installed layouts ship `adaptord` and `adaptor-plugin-host` side by side;
/// when the current executable cannot be resolved the libexec location is
/// used instead.
#[must_use]
pub fn default_plugin_host() -> Utf8PathBuf {
    env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(PLUGIN_HOST_BINARY))
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .unwrap_or_else(|| Utf8PathBuf::from(FALLBACK_PLUGIN_HOST))
}
