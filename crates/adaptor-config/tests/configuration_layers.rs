//! Precedence between defaults, the TOML file, and command-line flags.

use std::fs;

use adaptor_config::{
    Capability, Config, ConfigError, DEFAULT_CALL_TIMEOUT_MS, LogFormat, default_log_filter,
    default_log_format,
};
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct ConfigFile {
    _dir: TempDir,
    path: Utf8PathBuf,
}

#[fixture]
fn config_file() -> ConfigFile {
    let dir = TempDir::new().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("adaptord.toml"))
        .expect("temp path should be utf-8");
    fs::write(
        &path,
        r#"
log_filter = "debug"
log_format = "compact"
plugins_root = "/srv/plugins"
call_timeout_ms = 2500

[[forked_plugins]]
capability = "auth"
package_id = "org.example.auth"
path = "/opt/org.example.auth/libauth.so"

[[forked_plugins]]
capability = "push"
package_id = "org.example.push"
path = "/opt/org.example.push/libpush.so"
"#,
    )
    .expect("write config");
    ConfigFile { _dir: dir, path }
}

#[test]
fn defaults_apply_without_any_layer() {
    let config = Config::load_from_iter(["adaptord"]).expect("load defaults");
    assert_eq!(config.log_filter(), default_log_filter());
    assert_eq!(config.log_format(), default_log_format());
    assert_eq!(config.call_timeout_ms, DEFAULT_CALL_TIMEOUT_MS);
    assert!(config.forked_plugins.is_empty());
}

#[rstest]
fn file_values_override_defaults(config_file: ConfigFile) {
    let config = Config::load_from_iter(["adaptord", "--config-path", config_file.path.as_str()])
        .expect("load file");
    assert_eq!(config.log_filter(), "debug");
    assert_eq!(config.log_format(), LogFormat::Compact);
    assert_eq!(config.plugins_root().as_str(), "/srv/plugins");
    assert_eq!(config.call_timeout().as_millis(), 2500);
    assert_eq!(config.forked_plugins.len(), 2);
}

#[rstest]
fn cli_flags_override_file_values(config_file: ConfigFile) {
    let config = Config::load_from_iter([
        "adaptord",
        "--config-path",
        config_file.path.as_str(),
        "--log-filter",
        "warn",
        "--call-timeout-ms",
        "100",
    ])
    .expect("load layered");
    assert_eq!(config.log_filter(), "warn");
    assert_eq!(config.call_timeout_ms, 100);
    assert_eq!(config.log_format(), LogFormat::Compact, "file value survives");
}

#[rstest]
fn forked_plugins_filter_by_capability(config_file: ConfigFile) {
    let config = Config::load_from_iter(["adaptord", "--config-path", config_file.path.as_str()])
        .expect("load file");
    let auth: Vec<_> = config.forked_plugins_for(Capability::Auth).collect();
    assert_eq!(auth.len(), 1);
    assert_eq!(
        auth.first().map(|entry| entry.package_id.as_str()),
        Some("org.example.auth")
    );
    assert_eq!(config.forked_plugins_for(Capability::Message).count(), 0);
}

#[test]
fn plugin_dir_joins_capability_name() {
    let config = Config::load_from_iter(["adaptord", "--plugins-root", "/srv/plugins"])
        .expect("load");
    assert_eq!(config.plugin_dir(Capability::Contact).as_str(), "/srv/plugins/contact");
}

#[test]
fn zero_timeout_fails_validation() {
    let error = Config::load_from_iter(["adaptord", "--call-timeout-ms", "0"])
        .expect_err("zero timeout should be rejected");
    assert!(
        matches!(error, ConfigError::Invalid { field: "call_timeout_ms", .. }),
        "unexpected error: {error}"
    );
}

#[test]
fn malformed_file_reports_parse_error() {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("broken.toml");
    fs::write(&path, "call_timeout_ms = \"soon\"\n").expect("write config");
    let error = Config::load_from_iter([
        "adaptord",
        "--config-path",
        path.to_str().expect("utf-8 path"),
    ])
    .expect_err("malformed file should fail");
    assert!(matches!(error, ConfigError::Parse { .. }), "unexpected error: {error}");
}

#[test]
fn unknown_file_keys_are_rejected() {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("typo.toml");
    fs::write(&path, "call_timeout = 10\n").expect("write config");
    let error = Config::load_from_iter([
        "adaptord",
        "--config-path",
        path.to_str().expect("utf-8 path"),
    ])
    .expect_err("unknown key should fail");
    assert!(matches!(error, ConfigError::Parse { .. }));
}

#[test]
fn missing_file_reports_read_error() {
    let error = Config::load_from_iter(["adaptord", "--config-path", "/nonexistent/adaptord.toml"])
        .expect_err("missing file should fail");
    assert!(matches!(error, ConfigError::Read { .. }));
    assert!(error.to_string().contains("/nonexistent/adaptord.toml"));
}

#[test]
fn help_is_informational() {
    let error = Config::load_from_iter(["adaptord", "--help"]).expect_err("help exits early");
    assert!(error.is_informational());
}

#[test]
fn invalid_log_format_is_a_cli_error() {
    let error = Config::load_from_iter(["adaptord", "--log-format", "xml"])
        .expect_err("unknown format should fail");
    assert!(matches!(error, ConfigError::Cli { .. }));
    assert!(!error.is_informational());
}
