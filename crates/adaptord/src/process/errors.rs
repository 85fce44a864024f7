//! Defines the error surface for daemon launch and supervision.

use thiserror::Error;

use crate::bootstrap::BootstrapError;

use super::shutdown::ShutdownError;

/// Errors surfaced while launching or supervising the daemon process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Bootstrap failed before the daemon was ready.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// Waiting for a shutdown signal failed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    /// One or more adaptors did not stop cleanly.
    #[error("{failures} adaptor(s) did not stop cleanly")]
    Stop {
        /// Number of adaptors whose stop failed.
        failures: usize,
    },
}
