//! Authoring contract for capability plugins.
//!
//! A plugin implements [`CapabilityPlugin`]; the crate wraps it in a
//! [`crate::PluginDispatcher`] which owns the context table and turns wire
//! messages into trait calls. The same implementation serves both trust
//! tiers: exported through [`crate::export_plugin!`] it is loaded in-process,
//! and hosted by `adaptor-plugin-host` it runs in its own process.

use std::collections::BTreeMap;

use adaptor_config::Capability;
use thiserror::Error;

use crate::error::AdaptorError;
use crate::message::Param;
use crate::operation::{CapabilityOperations, Operation};

/// Failure reported by plugin code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginFailure {
    /// A positional argument was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The plugin does not implement the operation.
    #[error("operation not supported")]
    Unsupported,
    /// Plugin-specific failure.
    #[error("plugin error {code}: {message}")]
    Internal {
        /// Plugin-defined error code.
        code: i32,
        /// Description for the caller.
        message: String,
    },
}

impl PluginFailure {
    /// Converts the failure into the error reported for `operation`.
    #[must_use]
    pub fn into_error(self, operation: Operation) -> AdaptorError {
        match self {
            Self::InvalidArgument(message) => AdaptorError::InvalidArgument { message },
            Self::Unsupported => AdaptorError::Unsupported {
                operation: operation.as_str().to_owned(),
            },
            Self::Internal { code, message } => AdaptorError::PluginInternal { code, message },
        }
    }
}

/// Identity a context is opened with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Account the session belongs to.
    pub user_id: String,
    /// Application registered with the service.
    pub app_id: String,
    /// Shared secret of the application.
    pub app_secret: String,
}

impl Credentials {
    /// Creates credentials for `user_id` with the given application keys.
    pub fn new(
        user_id: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
        }
    }

    /// Reads credentials from `create_context` parameters.
    ///
    /// The user id is required; the application id and secret default to
    /// empty strings.
    ///
    /// # Errors
    ///
    /// Returns [`PluginFailure::InvalidArgument`] when the user id is absent
    /// or empty, or when any value is not a string.
    pub fn from_params(params: &[Param]) -> Result<Self, PluginFailure> {
        let text = |index: usize, name: &str| -> Result<String, PluginFailure> {
            match params.get(index) {
                None => Ok(String::new()),
                Some(Param::Str(value)) => Ok(value.clone()),
                Some(Param::Num(_)) => Err(PluginFailure::InvalidArgument(format!(
                    "{name} must be a string"
                ))),
            }
        };
        let credentials = Self {
            user_id: text(0, "user_id")?,
            app_id: text(1, "app_id")?,
            app_secret: text(2, "app_secret")?,
        };
        if credentials.user_id.is_empty() {
            return Err(PluginFailure::InvalidArgument(String::from(
                "user_id is required",
            )));
        }
        Ok(credentials)
    }

    /// Encodes the credentials as `create_context` parameters.
    #[must_use]
    pub fn to_params(&self) -> Vec<Param> {
        vec![
            Param::from(self.user_id.as_str()),
            Param::from(self.app_id.as_str()),
            Param::from(self.app_secret.as_str()),
        ]
    }
}

/// Per-session state owned by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextState {
    credentials: Credentials,
    access_token: Option<String>,
    attributes: BTreeMap<String, String>,
}

impl ContextState {
    /// Creates state for a freshly opened session.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            access_token: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Identity the context was opened with.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Current access token.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Replaces the access token.
    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.access_token = Some(token.into());
    }

    /// Drops the access token.
    pub fn clear_access_token(&mut self) {
        self.access_token = None;
    }

    /// Plugin-defined attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Sets a plugin-defined attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }
}

/// A capability implementation.
///
/// Only [`CapabilityPlugin::create_context`] is required; everything else
/// has a default. Calls are serialised by the owning dispatcher, so methods
/// take `&mut self`.
pub trait CapabilityPlugin: Send {
    /// Plugin URI used as the registry key.
    fn uri(&self) -> &str;

    /// Capability served by the plugin.
    fn capability(&self) -> Capability;

    /// Operations the plugin implements.
    ///
    /// Must include the capability's mandatory operations. Requests for
    /// anything else are answered `unsupported` without reaching
    /// [`CapabilityPlugin::invoke`].
    fn operations(&self) -> &[Operation] {
        self.capability().operations()
    }

    /// Opens a session.
    ///
    /// # Errors
    ///
    /// Returns a [`PluginFailure`] when the session cannot be opened.
    fn create_context(&mut self, credentials: Credentials) -> Result<ContextState, PluginFailure>;

    /// Closes a session. The default accepts every context.
    ///
    /// # Errors
    ///
    /// Returns a [`PluginFailure`] when closing fails; the context is gone
    /// either way.
    fn destroy_context(&mut self, state: ContextState) -> Result<(), PluginFailure> {
        drop(state);
        Ok(())
    }

    /// Runs a context-bearing operation and returns the reply parameters.
    ///
    /// # Errors
    ///
    /// Returns [`PluginFailure::Unsupported`] unless overridden.
    fn invoke(
        &mut self,
        operation: Operation,
        state: &mut ContextState,
        params: &[Param],
    ) -> Result<Vec<Param>, PluginFailure> {
        let _ = (operation, state, params);
        Err(PluginFailure::Unsupported)
    }
}
