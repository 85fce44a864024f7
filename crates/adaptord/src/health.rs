//! Structured health reporting for daemon lifecycle events.

use std::sync::Arc;

use adaptor_config::{Capability, Config, ForkedPluginEntry};
use adaptor_plugins::{AdaptorError, AdaptorListener};

use crate::bootstrap::BootstrapError;

const HEALTH_TARGET: &str = "adaptord::health";

/// Observer for daemon and adaptor lifecycle events.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked after every adaptor is running.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Invoked when bootstrap fails.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked after an adaptor's listener starts.
    fn adaptor_started(&self, capability: Capability, plugins: usize);

    /// Invoked when a configured forked plugin could not be started.
    fn forked_plugin_failed(&self, entry: &ForkedPluginEntry, error: &AdaptorError);

    /// Invoked when a forked plugin died and left its registry.
    fn plugin_removed(&self, capability: Capability, uri: &str);

    /// Invoked after an adaptor stops, with the error if stopping failed.
    fn adaptor_stopped(&self, capability: Capability, error: Option<&AdaptorError>);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter + ?Sized,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        (**self).bootstrap_succeeded(config);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn adaptor_started(&self, capability: Capability, plugins: usize) {
        (**self).adaptor_started(capability, plugins);
    }

    fn forked_plugin_failed(&self, entry: &ForkedPluginEntry, error: &AdaptorError) {
        (**self).forked_plugin_failed(entry, error);
    }

    fn plugin_removed(&self, capability: Capability, uri: &str) {
        (**self).plugin_removed(capability, uri);
    }

    fn adaptor_stopped(&self, capability: Capability, error: Option<&AdaptorError>) {
        (**self).adaptor_stopped(capability, error);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            "starting daemon bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            plugins_root = %config.plugins_root(),
            forked_plugins = config.forked_plugins.len(),
            log_filter = %config.log_filter(),
            log_format = %config.log_format(),
            "daemon bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "daemon bootstrap failed"
        );
    }

    fn adaptor_started(&self, capability: Capability, plugins: usize) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "adaptor_started",
            capability = %capability,
            plugins,
            "adaptor started"
        );
    }

    fn forked_plugin_failed(&self, entry: &ForkedPluginEntry, error: &AdaptorError) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "forked_plugin_failed",
            capability = %entry.capability,
            package = %entry.package_id,
            path = %entry.path,
            error = %error,
            "forked plugin not started"
        );
    }

    fn plugin_removed(&self, capability: Capability, uri: &str) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "plugin_removed",
            capability = %capability,
            plugin = uri,
            "plugin exited and was unregistered"
        );
    }

    fn adaptor_stopped(&self, capability: Capability, error: Option<&AdaptorError>) {
        match error {
            None => tracing::info!(
                target: HEALTH_TARGET,
                event = "adaptor_stopped",
                capability = %capability,
                "adaptor stopped"
            ),
            Some(error) => tracing::warn!(
                target: HEALTH_TARGET,
                event = "adaptor_stop_failed",
                capability = %capability,
                error = %error,
                "adaptor did not stop cleanly"
            ),
        }
    }
}

/// Forwards adaptor notifications to a [`HealthReporter`].
pub(crate) struct ReporterListener {
    reporter: Arc<dyn HealthReporter>,
}

impl ReporterListener {
    pub(crate) const fn new(reporter: Arc<dyn HealthReporter>) -> Self {
        Self { reporter }
    }
}

impl AdaptorListener for ReporterListener {
    fn plugin_removed(&self, capability: Capability, uri: &str) {
        self.reporter.plugin_removed(capability, uri);
    }
}
