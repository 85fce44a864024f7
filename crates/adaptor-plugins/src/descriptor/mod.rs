//! Loaded plugins and the sessions opened on them.
//!
//! A [`PluginHandle`] is a shared borrow of one plugin descriptor: cloning
//! it takes a reference and dropping it releases one. The descriptor is
//! destroyed exactly once, when the last handle goes away. Any context the
//! plugin still holds at that point is destroyed best-effort before the
//! backend is shut down.
//!
//! A [`PluginContext`] owns one plugin session and keeps its plugin alive.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use adaptor_config::Capability;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::backend::{PluginBackend, TrustTier};
use crate::context::ContextId;
use crate::error::AdaptorError;
use crate::message::{Param, WireMessage};
use crate::operation::{CapabilityOperations, Operation};
use crate::plugin::Credentials;

/// Log target for plugin lifecycle events.
pub(crate) const DESCRIPTOR_TARGET: &str = "adaptor_plugins::descriptor";

static NEXT_PLUGIN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a loaded plugin.
///
/// Unlike the URI, an id is never reused, so a late death notification
/// cannot remove a plugin that was loaded again under the same URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(u64);

impl PluginId {
    /// Takes the next id from the process-wide counter.
    pub(crate) fn allocate() -> Self {
        Self(NEXT_PLUGIN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a plugin came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSource {
    /// Registry key.
    pub uri: String,
    /// Library the plugin was loaded from.
    pub path: Utf8PathBuf,
    /// Capability it serves.
    pub capability: Capability,
    /// Where its code runs.
    pub tier: TrustTier,
}

struct PluginDescriptor {
    id: PluginId,
    source: PluginSource,
    backend: Box<dyn PluginBackend>,
    call_timeout: Duration,
    contexts: Mutex<HashSet<ContextId>>,
}

impl PluginDescriptor {
    fn call(&self, request: WireMessage) -> Result<WireMessage, AdaptorError> {
        let Some(operation) = request.operation() else {
            return Err(AdaptorError::Unsupported {
                operation: request.function_name().as_str().to_owned(),
            });
        };
        if !self.source.capability.supports(operation) {
            return Err(AdaptorError::Unsupported {
                operation: operation.as_str().to_owned(),
            });
        }
        let context = request.context_id();
        let result = self.backend.call(request, self.call_timeout);
        if operation.is_lifecycle() {
            self.track_context(operation, context, &result);
        }
        result
    }

    /// Mirrors the plugin's context table so leftovers can be destroyed
    /// with the plugin.
    fn track_context(
        &self,
        operation: Operation,
        context: ContextId,
        result: &Result<WireMessage, AdaptorError>,
    ) {
        match (operation, result) {
            (Operation::CreateContext, Ok(reply)) => {
                if let Some(id) = reply.param_num(1).and_then(ContextId::from_param) {
                    self.context_table().insert(id);
                }
            }
            (Operation::DestroyContext, _) => {
                self.context_table().remove(&context);
            }
            _ => {}
        }
    }

    fn context_table(&self) -> MutexGuard<'_, HashSet<ContextId>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PluginDescriptor {
    fn drop(&mut self) {
        let leftover: Vec<ContextId> = self.context_table().drain().collect();
        for context in leftover {
            let request = WireMessage::call(Operation::DestroyContext, context);
            if let Err(error) = self.backend.call(request, self.call_timeout) {
                warn!(
                    target: DESCRIPTOR_TARGET,
                    plugin = %self.source.uri,
                    context = %context,
                    error = %error,
                    "failed to destroy leftover context"
                );
            }
        }
        self.backend.shutdown();
        info!(
            target: DESCRIPTOR_TARGET,
            plugin = %self.source.uri,
            id = %self.id,
            tier = %self.source.tier,
            "plugin destroyed"
        );
    }
}

/// Shared, reference-counted borrow of a loaded plugin.
#[derive(Clone)]
pub struct PluginHandle(Arc<PluginDescriptor>);

impl PluginHandle {
    /// Wraps a backend in a new descriptor with a single reference.
    #[must_use]
    pub fn new(
        source: PluginSource,
        backend: Box<dyn PluginBackend>,
        call_timeout: Duration,
    ) -> Self {
        let id = PluginId::allocate();
        debug!(
            target: DESCRIPTOR_TARGET,
            plugin = %source.uri,
            id = %id,
            tier = %source.tier,
            "plugin descriptor created"
        );
        Self(Arc::new(PluginDescriptor {
            id,
            source,
            backend,
            call_timeout,
            contexts: Mutex::new(HashSet::new()),
        }))
    }

    /// Process-unique plugin id.
    #[must_use]
    pub fn id(&self) -> PluginId {
        self.0.id
    }

    /// Registry key.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.0.source.uri
    }

    /// Library path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.0.source.path
    }

    /// Capability served.
    #[must_use]
    pub fn capability(&self) -> Capability {
        self.0.source.capability
    }

    /// Trust tier.
    #[must_use]
    pub fn tier(&self) -> TrustTier {
        self.0.source.tier
    }

    /// Number of live handles, this one included.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Number of contexts the plugin currently holds.
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.0.context_table().len()
    }

    /// Returns `true` when both handles borrow the same descriptor.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Sends a raw request with the configured deadline.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Unsupported`] for operations outside the
    /// plugin's capability, without reaching the plugin. Otherwise returns
    /// the backend's error.
    pub fn call(&self, request: WireMessage) -> Result<WireMessage, AdaptorError> {
        self.0.call(request)
    }

    /// Opens a session on the plugin.
    ///
    /// # Errors
    ///
    /// Transport failures (`Channel`, `Timeout`) are returned unchanged;
    /// anything the plugin rejects becomes [`AdaptorError::Create`].
    pub fn create_context(
        &self,
        credentials: &Credentials,
    ) -> Result<PluginContext, AdaptorError> {
        let request = WireMessage::call(Operation::CreateContext, ContextId::NONE)
            .with_params(credentials.to_params());
        let reply = self.call(request).map_err(|error| match error {
            AdaptorError::Channel { .. } | AdaptorError::Timeout { .. } => error,
            other => AdaptorError::create(format!(
                "plugin '{}' refused the context: {other}",
                self.uri()
            )),
        })?;
        let id = reply
            .param_num(1)
            .and_then(ContextId::from_param)
            .filter(|id| !id.is_none())
            .ok_or_else(|| {
                AdaptorError::create(format!("plugin '{}' returned no context id", self.uri()))
            })?;
        Ok(PluginContext {
            handle: self.clone(),
            id,
            access_token: None,
            destroyed: false,
        })
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.0.id)
            .field("source", &self.0.source)
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}

/// One session opened on a plugin.
///
/// Dropping a context that was not destroyed explicitly destroys it
/// best-effort.
pub struct PluginContext {
    handle: PluginHandle,
    id: ContextId,
    access_token: Option<String>,
    destroyed: bool,
}

impl PluginContext {
    /// Id issued by the plugin.
    #[must_use]
    pub const fn id(&self) -> ContextId {
        self.id
    }

    /// Plugin the context belongs to.
    #[must_use]
    pub const fn handle(&self) -> &PluginHandle {
        &self.handle
    }

    /// Token stored by the last successful login or refresh.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Runs `operation` on this context.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the plugin or the transport.
    pub fn invoke(
        &self,
        operation: Operation,
        params: Vec<Param>,
    ) -> Result<WireMessage, AdaptorError> {
        self.handle
            .call(WireMessage::call(operation, self.id).with_params(params))
    }

    /// Asks whether the session is authenticated.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the plugin or the transport.
    pub fn is_auth(&self) -> Result<bool, AdaptorError> {
        let reply = self.invoke(Operation::IsAuth, Vec::new())?;
        Ok(reply.param_num(1).is_some_and(|value| value != 0))
    }

    /// Joins the session to the service, returning the reply parameters.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the plugin or the transport.
    pub fn join(&self, params: Vec<Param>) -> Result<Vec<Param>, AdaptorError> {
        Ok(self.invoke(Operation::Join, params)?.params().to_vec())
    }

    /// Logs in and stores the access token returned as the first parameter.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::InvalidArgument`] if the plugin's reply
    /// carries no token, or
    /// the error reported by the plugin or the transport.
    pub fn login(&mut self) -> Result<&str, AdaptorError> {
        let reply = self.invoke(Operation::Login, Vec::new())?;
        self.store_token(&reply, Operation::Login)
    }

    /// Refreshes the access token.
    ///
    /// # Errors
    ///
    /// As for [`PluginContext::login`].
    pub fn refresh(&mut self) -> Result<&str, AdaptorError> {
        let reply = self.invoke(Operation::Refresh, Vec::new())?;
        self.store_token(&reply, Operation::Refresh)
    }

    fn store_token(
        &mut self,
        reply: &WireMessage,
        operation: Operation,
    ) -> Result<&str, AdaptorError> {
        let token = reply.param_str(1).ok_or_else(|| {
            AdaptorError::invalid_argument(format!(
                "{operation} reply from '{}' carries no access token",
                self.handle.uri()
            ))
        })?;
        Ok(self.access_token.insert(token.to_owned()).as_str())
    }

    /// Closes the session.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Destroy`] when the plugin refuses; the
    /// context is released locally either way.
    pub fn destroy(mut self) -> Result<(), AdaptorError> {
        self.destroyed = true;
        self.access_token = None;
        self.destroy_remote()
    }

    fn destroy_remote(&self) -> Result<(), AdaptorError> {
        self.handle
            .call(WireMessage::call(Operation::DestroyContext, self.id))
            .map(drop)
            .map_err(|error| AdaptorError::Destroy {
                message: format!("context {} on '{}': {error}", self.id, self.handle.uri()),
            })
    }
}

impl Drop for PluginContext {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        if let Err(error) = self.destroy_remote() {
            warn!(
                target: DESCRIPTOR_TARGET,
                plugin = %self.handle.uri(),
                context = %self.id,
                error = %error,
                "failed to destroy dropped context"
            );
        }
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin", &self.handle.uri())
            .field("id", &self.id)
            .field("authenticated", &self.access_token.is_some())
            .finish()
    }
}
