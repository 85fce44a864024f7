//! Waiting for the signal that stops every adaptor.
//!
//! Handlers are registered before bootstrap starts forked plugin hosts. A
//! termination request that lands while plugins are still starting is
//! held until [`ShutdownSignal::wait`] runs, so the adaptors are always
//! stopped and no host is left orphaned by the default signal action.

use std::fmt;
use std::io;
use std::sync::{Mutex, PoisonError};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use signal_hook::low_level::signal_name;
use thiserror::Error;
use tracing::info;

use super::PROCESS_TARGET;

/// Signals that stop the daemon. SIGHUP does not reload.
pub(crate) const SHUTDOWN_SIGNALS: [i32; 4] = [SIGTERM, SIGINT, SIGQUIT, SIGHUP];

/// Source of the daemon's stop request.
pub trait ShutdownSignal: Send + Sync {
    /// Blocks until the adaptors should be stopped.
    ///
    /// # Errors
    ///
    /// Returns a [`ShutdownError`] when the source cannot deliver.
    fn wait(&self) -> Result<(), ShutdownError>;
}

/// Why the daemon cannot wait for its stop request.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// `signal-hook` could not register the stop signals.
    #[error("cannot register the daemon's stop signals: {source}")]
    Install {
        /// Registration error.
        #[source]
        source: io::Error,
    },
}

/// Handlers for SIGTERM, SIGINT, SIGQUIT and SIGHUP.
pub struct SystemShutdownSignal {
    signals: Mutex<Signals>,
}

impl SystemShutdownSignal {
    /// Registers the handlers. Signals arriving from here on are queued for
    /// [`ShutdownSignal::wait`].
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::Install`] if registration fails.
    pub fn install() -> Result<Self, ShutdownError> {
        let signals =
            Signals::new(SHUTDOWN_SIGNALS).map_err(|source| ShutdownError::Install { source })?;
        Ok(Self {
            signals: Mutex::new(signals),
        })
    }
}

impl fmt::Debug for SystemShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemShutdownSignal")
            .field("signals", &SHUTDOWN_SIGNALS)
            .finish_non_exhaustive()
    }
}

impl ShutdownSignal for SystemShutdownSignal {
    fn wait(&self) -> Result<(), ShutdownError> {
        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(signal) = signals.forever().next() {
            info!(
                target: PROCESS_TARGET,
                signal,
                name = signal_name(signal).unwrap_or("unknown"),
                "stopping adaptors on signal"
            );
        }
        Ok(())
    }
}
