//! One adaptor per capability: a plugin registry plus the listener that
//! services its forked plugins.
//!
//! The adaptor is the only object the daemon talks to. Plugins of both
//! tiers come back as [`PluginHandle`]s, so callers never branch on where
//! a plugin runs. When a forked plugin's channel dies the listener thread
//! unregisters it and tells the upward [`AdaptorListener`], if one is set.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use adaptor_config::{Capability, Config};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};

use crate::backend::TrustTier;
use crate::descriptor::{PluginHandle, PluginId, PluginSource};
use crate::error::AdaptorError;
use crate::forked::{ForkedBackend, PluginChannel};
use crate::listener::{ChannelSlot, DeathHook, ListenerHandle};
use crate::registry::{PluginRegistry, ScanSummary};

/// Log target for adaptor lifecycle events.
pub(crate) const ADAPTOR_TARGET: &str = "adaptor_plugins::adaptor";

/// Receives plugin events raised by an adaptor.
pub trait AdaptorListener: Send + Sync {
    /// A forked plugin died and was unregistered.
    fn plugin_removed(&self, capability: Capability, uri: &str);
}

/// Per-adaptor settings derived from the daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptorSettings {
    /// Directory scanned for in-process plugins on creation.
    pub plugin_dir: Utf8PathBuf,
    /// Executable hosting forked plugins.
    pub plugin_host: Utf8PathBuf,
    /// Deadline of one plugin call.
    pub call_timeout: Duration,
    /// Bounded wait of one listener pass.
    pub listener_wait: Duration,
}

impl AdaptorSettings {
    /// Settings for `capability` under `config`.
    #[must_use]
    pub fn from_config(config: &Config, capability: Capability) -> Self {
        Self {
            plugin_dir: config.plugin_dir(capability),
            plugin_host: config.plugin_host().to_path_buf(),
            call_timeout: config.call_timeout(),
            listener_wait: config.listener_wait(),
        }
    }
}

type UpwardSlot = Mutex<Option<Arc<dyn AdaptorListener>>>;

struct AdaptorShared {
    capability: Capability,
    registry: PluginRegistry,
    upward: UpwardSlot,
}

impl AdaptorShared {
    fn plugin_died(&self, id: PluginId) {
        let Some(uri) = self.registry.remove_by_id(id) else {
            debug!(
                target: ADAPTOR_TARGET,
                capability = %self.capability,
                id = %id,
                "dead plugin was already unregistered"
            );
            return;
        };
        warn!(
            target: ADAPTOR_TARGET,
            capability = %self.capability,
            plugin = %uri,
            id = %id,
            "forked plugin died and was unregistered"
        );
        let installed = self
            .upward
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(upward) = installed {
            upward.plugin_removed(self.capability, &uri);
        }
    }
}

/// Plugin host for one capability.
pub struct Adaptor {
    capability: Capability,
    settings: AdaptorSettings,
    shared: Arc<AdaptorShared>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl Adaptor {
    /// Creates the adaptor and loads the in-process plugins found in the
    /// settings' plugin directory.
    ///
    /// A missing or unreadable directory is logged and leaves the registry
    /// empty.
    #[must_use]
    pub fn create(capability: Capability, settings: AdaptorSettings) -> Self {
        let adaptor = Self::empty(capability, settings);
        match adaptor
            .shared
            .registry
            .load_plugins_from_directory(&adaptor.settings.plugin_dir)
        {
            Ok(ScanSummary { loaded, failed }) => info!(
                target: ADAPTOR_TARGET,
                capability = %capability,
                loaded,
                failed,
                "adaptor created"
            ),
            Err(error) => warn!(
                target: ADAPTOR_TARGET,
                capability = %capability,
                dir = %adaptor.settings.plugin_dir,
                error = %error,
                "plugin directory unavailable; adaptor starts empty"
            ),
        }
        adaptor
    }

    /// Creates the adaptor without scanning for plugins.
    #[must_use]
    pub fn empty(capability: Capability, settings: AdaptorSettings) -> Self {
        let shared = Arc::new(AdaptorShared {
            capability,
            registry: PluginRegistry::new(capability, settings.call_timeout),
            upward: Mutex::new(None),
        });
        Self {
            capability,
            settings,
            shared,
            listener: Mutex::new(None),
        }
    }

    /// Capability served.
    #[must_use]
    pub const fn capability(&self) -> Capability {
        self.capability
    }

    /// Settings the adaptor was created with.
    #[must_use]
    pub const fn settings(&self) -> &AdaptorSettings {
        &self.settings
    }

    /// Registry of loaded plugins.
    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.shared.registry
    }

    /// Starts the plugin listener.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::AlreadyStarted`] if the listener is running,
    /// or [`AdaptorError::Create`] if it cannot be spawned.
    pub fn start(&self) -> Result<(), AdaptorError> {
        let mut listener = self.listener_slot();
        if listener.is_some() {
            return Err(AdaptorError::AlreadyStarted {
                capability: self.capability,
            });
        }
        let weak: Weak<AdaptorShared> = Arc::downgrade(&self.shared);
        let on_dead: DeathHook = Arc::new(move |id: PluginId| {
            if let Some(shared) = weak.upgrade() {
                shared.plugin_died(id);
            }
        });
        *listener = Some(ListenerHandle::spawn(
            self.capability,
            self.settings.listener_wait,
            on_dead,
        )?);
        info!(target: ADAPTOR_TARGET, capability = %self.capability, "adaptor started");
        Ok(())
    }

    /// Stops the plugin listener and unregisters every forked plugin.
    ///
    /// Calls still waiting on a forked plugin fail with a channel error.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::NotStarted`] if the adaptor is not running,
    /// or [`AdaptorError::Channel`] if the listener thread panicked.
    pub fn stop(&self) -> Result<(), AdaptorError> {
        let listener = self
            .listener_slot()
            .take()
            .ok_or(AdaptorError::NotStarted {
                capability: self.capability,
            })?;
        let outcome = listener.stop();
        let forked: Vec<PluginId> = self
            .shared
            .registry
            .list()
            .iter()
            .filter(|handle| handle.tier() == TrustTier::Forked)
            .map(PluginHandle::id)
            .collect();
        for id in forked {
            if let Some(uri) = self.shared.registry.remove_by_id(id) {
                debug!(
                    target: ADAPTOR_TARGET,
                    capability = %self.capability,
                    plugin = %uri,
                    "forked plugin unregistered on stop"
                );
            }
        }
        info!(target: ADAPTOR_TARGET, capability = %self.capability, "adaptor stopped");
        outcome
    }

    /// Returns `true` while the listener is running.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.listener_slot().is_some()
    }

    /// Loads an in-process plugin library.
    ///
    /// # Errors
    ///
    /// As for [`PluginRegistry::load`].
    pub fn load_plugin(&self, path: &Utf8Path) -> Result<PluginHandle, AdaptorError> {
        self.shared.registry.load(path)
    }

    /// Runs the plugin library at `path` in a plugin host process and
    /// registers it under `package_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::NotStarted`] if the listener is not running,
    /// or [`AdaptorError::Create`] if the package is already registered or
    /// the host cannot be spawned.
    pub fn load_forked(
        &self,
        package_id: &str,
        path: &Utf8Path,
    ) -> Result<PluginHandle, AdaptorError> {
        if !self.is_started() {
            return Err(AdaptorError::NotStarted {
                capability: self.capability,
            });
        }
        if self.shared.registry.has(package_id) {
            return Err(AdaptorError::create(format!(
                "plugin '{package_id}' is already registered"
            )));
        }
        let (backend, channel) =
            ForkedBackend::spawn(&self.settings.plugin_host, self.capability, package_id, path)?;
        self.attach_forked(package_id, path, backend, channel)
    }

    /// Registers a forked backend and hands its channel to the listener.
    ///
    /// The plugin is registered before the listener sees its channel, so a
    /// plugin that dies immediately is still unregistered.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::NotStarted`] if the listener is not running,
    /// [`AdaptorError::Create`] if registration fails, or
    /// [`AdaptorError::Channel`] if the listener cannot be reached. The
    /// registry is unchanged on failure.
    pub fn attach_forked(
        &self,
        uri: &str,
        path: &Utf8Path,
        backend: ForkedBackend,
        channel: PluginChannel,
    ) -> Result<PluginHandle, AdaptorError> {
        let handle = PluginHandle::new(
            PluginSource {
                uri: uri.to_owned(),
                path: path.to_path_buf(),
                capability: self.capability,
                tier: TrustTier::Forked,
            },
            Box::new(backend),
            self.settings.call_timeout,
        );
        let listener = self.listener_slot();
        let Some(active) = listener.as_ref() else {
            return Err(AdaptorError::NotStarted {
                capability: self.capability,
            });
        };
        self.shared.registry.add(handle.clone())?;
        if let Err(error) = active.register(ChannelSlot::new(handle.id(), uri, channel)) {
            drop(listener);
            if let Some(uri) = self.shared.registry.remove_by_id(handle.id()) {
                debug!(
                    target: ADAPTOR_TARGET,
                    capability = %self.capability,
                    plugin = %uri,
                    "rolled back forked plugin registration"
                );
            }
            return Err(error);
        }
        info!(
            target: ADAPTOR_TARGET,
            capability = %self.capability,
            plugin = uri,
            id = %handle.id(),
            "forked plugin attached"
        );
        Ok(handle)
    }

    /// Returns a reference to the plugin registered under `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::NotFound`] if `uri` is not registered.
    pub fn plugin(&self, uri: &str) -> Result<PluginHandle, AdaptorError> {
        self.shared
            .registry
            .find_by_uri(uri)
            .ok_or_else(|| AdaptorError::NotFound {
                name: uri.to_owned(),
            })
    }

    /// Returns a reference to every registered plugin.
    #[must_use]
    pub fn plugins(&self) -> Vec<PluginHandle> {
        self.shared.registry.list()
    }

    /// Returns `true` if `uri` is registered.
    #[must_use]
    pub fn has_plugin(&self, uri: &str) -> bool {
        self.shared.registry.has(uri)
    }

    /// Unregisters the plugin under `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::NotFound`] if `uri` is not registered.
    pub fn unload(&self, uri: &str) -> Result<(), AdaptorError> {
        self.shared.registry.remove(uri)
    }

    /// Installs the upward listener, replacing any previous one.
    pub fn set_listener(&self, listener: Arc<dyn AdaptorListener>) {
        *self.upward_slot() = Some(listener);
    }

    /// Removes the upward listener.
    pub fn clear_listener(&self) {
        self.upward_slot().take();
    }

    fn listener_slot(&self) -> MutexGuard<'_, Option<ListenerHandle>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upward_slot(&self) -> MutexGuard<'_, Option<Arc<dyn AdaptorListener>>> {
        self.shared
            .upward
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Adaptor {
    fn drop(&mut self) {
        if !self.is_started() {
            return;
        }
        if let Err(error) = self.stop() {
            error!(
                target: ADAPTOR_TARGET,
                capability = %self.capability,
                error = %error,
                "adaptor did not stop cleanly"
            );
        }
    }
}

impl fmt::Debug for Adaptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adaptor")
            .field("capability", &self.capability)
            .field("settings", &self.settings)
            .field("plugins", &self.shared.registry.len())
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests;
