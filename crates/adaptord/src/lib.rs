//! The adaptor daemon.
//!
//! `adaptord` loads the layered [`adaptor_config::Config`], installs
//! structured telemetry, and brings up one [`adaptor_plugins::Adaptor`] per
//! capability. Each adaptor scans its plugin directory for in-process
//! plugins, starts its listener thread, and then launches the third-party
//! plugins named in `forked_plugins` through `adaptor-plugin-host`. A forked
//! plugin that cannot be started is reported and skipped.
//!
//! The daemon then blocks until SIGTERM, SIGINT, SIGQUIT or SIGHUP arrives
//! and stops every adaptor before exiting. Lifecycle events, including
//! forked plugins that die while the daemon runs, flow through a
//! [`HealthReporter`].

mod bootstrap;
mod health;
mod process;
mod telemetry;

pub use bootstrap::{
    BootstrapError, ConfigLoader, Daemon, StaticConfigLoader, SystemConfigLoader, bootstrap_with,
};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use process::{LaunchError, ShutdownError, ShutdownSignal, SystemShutdownSignal, run_daemon};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
