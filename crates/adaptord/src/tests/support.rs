//! Test doubles shared by the daemon suites.

use std::sync::{Arc, Mutex};

use adaptor_config::{Capability, Config, ConfigError, ForkedPluginEntry};
use adaptor_plugins::AdaptorError;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use crate::bootstrap::{BootstrapError, ConfigLoader, Daemon, bootstrap_with};
use crate::health::HealthReporter;

/// Structured health events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HealthEvent {
    BootstrapStarting,
    BootstrapSucceeded,
    BootstrapFailed(String),
    AdaptorStarted(Capability),
    ForkedPluginFailed { package: String },
    PluginRemoved { capability: Capability, uri: String },
    AdaptorStopped { capability: Capability, clean: bool },
}

/// Records health events for assertions.
#[derive(Debug, Default)]
pub(crate) struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    pub(crate) fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn bootstrap_succeeded(&self, _config: &Config) {
        self.record(HealthEvent::BootstrapSucceeded);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        self.record(HealthEvent::BootstrapFailed(error.to_string()));
    }

    fn adaptor_started(&self, capability: Capability, _plugins: usize) {
        self.record(HealthEvent::AdaptorStarted(capability));
    }

    fn forked_plugin_failed(&self, entry: &ForkedPluginEntry, _error: &AdaptorError) {
        self.record(HealthEvent::ForkedPluginFailed {
            package: entry.package_id.clone(),
        });
    }

    fn plugin_removed(&self, capability: Capability, uri: &str) {
        self.record(HealthEvent::PluginRemoved {
            capability,
            uri: uri.to_owned(),
        });
    }

    fn adaptor_stopped(&self, capability: Capability, error: Option<&AdaptorError>) {
        self.record(HealthEvent::AdaptorStopped {
            capability,
            clean: error.is_none(),
        });
    }
}

/// Loader that points every path into a temporary directory.
pub(crate) struct TestConfigLoader {
    dir: TempDir,
    forked: Vec<ForkedPluginEntry>,
}

impl TestConfigLoader {
    pub(crate) fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temporary directory"),
            forked: Vec::new(),
        }
    }

    /// Adds a forked plugin whose host executable does not exist.
    pub(crate) fn with_forked(mut self, capability: Capability, package: &str) -> Self {
        self.forked.push(ForkedPluginEntry {
            capability,
            package_id: package.to_owned(),
            path: Utf8PathBuf::from(format!("/plugins/{package}.so")),
        });
        self
    }

    fn root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.dir.path().to_path_buf()).expect("utf-8 temp path")
    }
}

impl ConfigLoader for TestConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        let root = self.root();
        Ok(Config {
            plugins_root: root.join("plugins"),
            plugin_host: root.join("missing-plugin-host"),
            call_timeout_ms: 1_000,
            listener_wait_ms: 50,
            forked_plugins: self.forked.clone(),
            ..Config::default()
        })
    }
}

/// Loader that fails validation.
pub(crate) struct FailingConfigLoader;

impl ConfigLoader for FailingConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Config::load_from_iter(["adaptord", "--call-timeout-ms", "0"])
    }
}

/// Scenario world shared across BDD steps.
pub(crate) struct TestWorld {
    loader: Box<dyn ConfigLoader>,
    pub(crate) reporter: Arc<RecordingHealthReporter>,
    daemon: Option<Daemon>,
    bootstrap_error: Option<BootstrapError>,
    stop_failures: Option<usize>,
}

impl TestWorld {
    pub(crate) fn new() -> Self {
        Self {
            loader: Box::new(TestConfigLoader::new()),
            reporter: Arc::new(RecordingHealthReporter::default()),
            daemon: None,
            bootstrap_error: None,
            stop_failures: None,
        }
    }

    pub(crate) fn use_loader(&mut self, loader: impl ConfigLoader + 'static) {
        self.loader = Box::new(loader);
        self.daemon = None;
        self.bootstrap_error = None;
        self.stop_failures = None;
    }

    pub(crate) fn bootstrap(&mut self) {
        if self.daemon.is_some() || self.bootstrap_error.is_some() {
            return;
        }
        let reporter: Arc<dyn HealthReporter> = self.reporter.clone();
        match bootstrap_with(&*self.loader, reporter) {
            Ok(daemon) => self.daemon = Some(daemon),
            Err(error) => self.bootstrap_error = Some(error),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.stop_failures = self.daemon.take().map(Daemon::shutdown);
    }

    pub(crate) const fn daemon(&self) -> Option<&Daemon> {
        self.daemon.as_ref()
    }

    pub(crate) const fn bootstrap_error(&self) -> Option<&BootstrapError> {
        self.bootstrap_error.as_ref()
    }

    pub(crate) const fn stop_failures(&self) -> Option<usize> {
        self.stop_failures
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}
