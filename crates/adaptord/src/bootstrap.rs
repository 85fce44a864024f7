//! Daemon bootstrap orchestration.

use std::sync::Arc;

use adaptor_config::{Capability, Config, ConfigError};
use adaptor_plugins::{Adaptor, AdaptorError, AdaptorSettings};
use thiserror::Error;

use crate::health::{HealthReporter, ReporterListener};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the daemon configuration.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] of the first layer that fails.
    fn load(&self) -> Result<Config, ConfigError>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Config::load()
    }
}

/// Loader that returns a configuration resolved elsewhere.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps an already validated configuration.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: ConfigError,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// An adaptor's listener could not be started.
    #[error("failed to start the {capability} adaptor: {source}")]
    Adaptor {
        /// Capability of the adaptor.
        capability: Capability,
        /// Underlying adaptor error.
        #[source]
        source: AdaptorError,
    },
}

/// A bootstrapped daemon: one running adaptor per capability.
pub struct Daemon {
    config: Config,
    adaptors: Vec<Adaptor>,
    telemetry: TelemetryHandle,
    reporter: Arc<dyn HealthReporter>,
}

impl Daemon {
    /// Accessor for the resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Accessor for the telemetry handle, primarily useful for testing.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Every adaptor, in [`Capability::ALL`] order.
    #[must_use]
    pub fn adaptors(&self) -> &[Adaptor] {
        &self.adaptors
    }

    /// The adaptor serving `capability`.
    #[must_use]
    pub fn adaptor(&self, capability: Capability) -> Option<&Adaptor> {
        self.adaptors
            .iter()
            .find(|adaptor| adaptor.capability() == capability)
    }

    /// Stops every adaptor and reports the outcome of each.
    ///
    /// Returns the number of adaptors that did not stop cleanly.
    #[must_use]
    pub fn shutdown(self) -> usize {
        let mut failures = 0;
        for adaptor in &self.adaptors {
            let capability = adaptor.capability();
            adaptor.clear_listener();
            match adaptor.stop() {
                Ok(()) => self.reporter.adaptor_stopped(capability, None),
                Err(error) => {
                    failures += 1;
                    self.reporter.adaptor_stopped(capability, Some(&error));
                }
            }
        }
        failures
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .field("adaptors", &self.adaptors)
            .finish_non_exhaustive()
    }
}

/// Bootstraps the daemon using the supplied collaborators.
///
/// Creates and starts one adaptor per capability, then launches the
/// configured forked plugins. A forked plugin that fails to start is
/// reported and skipped; the daemon keeps serving everything else.
///
/// # Errors
///
/// Returns a [`BootstrapError`] when configuration, telemetry, or an
/// adaptor listener fails. Adaptors already started are stopped as they
/// are dropped.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
) -> Result<Daemon, BootstrapError> {
    reporter.bootstrap_starting();

    let config = loader
        .load()
        .map_err(|source| fail(&*reporter, BootstrapError::Configuration { source }))?;
    let telemetry = telemetry::initialise(&config)
        .map_err(|source| fail(&*reporter, BootstrapError::Telemetry { source }))?;

    let mut adaptors = Vec::with_capacity(Capability::ALL.len());
    for capability in Capability::ALL {
        let adaptor = start_adaptor(&config, capability, &reporter)
            .map_err(|source| fail(&*reporter, BootstrapError::Adaptor { capability, source }))?;
        adaptors.push(adaptor);
    }

    for adaptor in &adaptors {
        for entry in config.forked_plugins_for(adaptor.capability()) {
            if let Err(error) = adaptor.load_forked(&entry.package_id, &entry.path) {
                reporter.forked_plugin_failed(entry, &error);
            }
        }
    }

    reporter.bootstrap_succeeded(&config);
    Ok(Daemon {
        config,
        adaptors,
        telemetry,
        reporter,
    })
}

fn start_adaptor(
    config: &Config,
    capability: Capability,
    reporter: &Arc<dyn HealthReporter>,
) -> Result<Adaptor, AdaptorError> {
    let adaptor = Adaptor::create(capability, AdaptorSettings::from_config(config, capability));
    adaptor.set_listener(Arc::new(ReporterListener::new(Arc::clone(reporter))));
    adaptor.start()?;
    reporter.adaptor_started(capability, adaptor.plugins().len());
    Ok(adaptor)
}

fn fail(reporter: &dyn HealthReporter, error: BootstrapError) -> BootstrapError {
    reporter.bootstrap_failed(&error);
    error
}
