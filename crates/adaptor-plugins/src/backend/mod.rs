//! Call surface shared by both plugin trust tiers.
//!
//! A [`PluginBackend`] is the host-side "vtable" of a plugin: every
//! capability call becomes one wire request, and the backend decides how
//! it reaches the plugin. Call sites never branch on the tier.

mod library;

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use adaptor_config::Capability;
use strum::Display;

use crate::collector::{PluginDispatcher, RequestHandler};
use crate::error::AdaptorError;
use crate::message::WireMessage;
use crate::plugin::CapabilityPlugin;

pub use library::LibraryBackend;

/// Where a plugin's code runs relative to the adaptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TrustTier {
    /// Loaded into the adaptor process.
    InProcess,
    /// Executed by a separate plugin host process.
    Forked,
}

/// Transport to one loaded plugin.
pub trait PluginBackend: Send + Sync {
    /// Sends `request` and waits at most `deadline` for its reply.
    ///
    /// # Errors
    ///
    /// Returns the error carried by a failed reply, or a transport error.
    fn call(&self, request: WireMessage, deadline: Duration) -> Result<WireMessage, AdaptorError>;

    /// Releases transport resources. Called once, when the descriptor is
    /// destroyed.
    fn shutdown(&self) {}
}

/// Backend for a plugin linked into the adaptor binary.
///
/// Runs the dispatcher on the caller's thread; the deadline is not
/// enforced because there is no transport to wait on.
pub struct LocalBackend {
    dispatcher: Mutex<PluginDispatcher>,
    uri: String,
    capability: Capability,
}

impl LocalBackend {
    /// Wraps an already validated dispatcher.
    #[must_use]
    pub fn new(dispatcher: PluginDispatcher) -> Self {
        let uri = dispatcher.uri().to_owned();
        let capability = dispatcher.capability();
        Self {
            dispatcher: Mutex::new(dispatcher),
            uri,
            capability,
        }
    }

    /// Validates and wraps a plugin implementation.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Create`] if the plugin misses a mandatory
    /// operation.
    pub fn from_plugin(plugin: Box<dyn CapabilityPlugin>) -> Result<Self, AdaptorError> {
        PluginDispatcher::new(plugin).map(Self::new)
    }

    /// Plugin URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Capability served by the plugin.
    #[must_use]
    pub const fn capability(&self) -> Capability {
        self.capability
    }
}

impl PluginBackend for LocalBackend {
    fn call(&self, request: WireMessage, _deadline: Duration) -> Result<WireMessage, AdaptorError> {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle(&request)
            .into_result()
    }
}

impl fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBackend")
            .field("uri", &self.uri)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
