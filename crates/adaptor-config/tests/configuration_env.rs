//! Environment variables sit between the file and command-line layers.

use std::ffi::{OsStr, OsString};
use std::sync::{Mutex, MutexGuard};

use adaptor_config::{Config, LogFormat};
use once_cell::sync::Lazy;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct EnvOverride {
    key: &'static str,
    previous: Option<OsString>,
    guard: Option<MutexGuard<'static, ()>>,
}

impl EnvOverride {
    fn set_var(key: &'static str, value: &OsStr) -> Self {
        let guard = ENV_MUTEX
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let previous = std::env::var_os(key);
        // Environment mutation is unsafe in edition 2024; the guard restores
        // the previous value on drop.
        unsafe { std::env::set_var(key, value) };
        Self {
            key,
            previous,
            guard: Some(guard),
        }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => unsafe { std::env::set_var(self.key, value) },
            None => unsafe { std::env::remove_var(self.key) },
        }
        drop(self.guard.take());
    }
}

#[test]
fn environment_overrides_defaults() {
    let _override = EnvOverride::set_var("ADAPTOR_LOG_FORMAT", OsStr::new("compact"));
    let config = Config::load_from_iter(["adaptord"]).expect("load with env");
    assert_eq!(config.log_format(), LogFormat::Compact);
}

#[test]
fn cli_overrides_environment() {
    let _override = EnvOverride::set_var("ADAPTOR_CALL_TIMEOUT_MS", OsStr::new("750"));
    let config = Config::load_from_iter(["adaptord", "--call-timeout-ms", "1500"])
        .expect("load with env and cli");
    assert_eq!(config.call_timeout_ms, 1500);
}

#[test]
fn invalid_environment_value_fails_fast() {
    let _override = EnvOverride::set_var("ADAPTOR_LISTENER_WAIT_MS", OsStr::new("later"));
    let error = Config::load_from_iter(["adaptord"]).expect_err("non-numeric wait should fail");
    assert!(error.to_string().contains("invalid"), "unexpected error: {error}");
}
