//! Per-capability registry of loaded plugins.
//!
//! The registry owns one reference to every plugin it lists. Lookups hand
//! out further references as [`PluginHandle`] clones. The list mutex guards
//! membership only: plugin code never runs while it is held, and handles
//! leaving the registry are dropped after the guard is released.

use std::fs;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use adaptor_config::Capability;
use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::backend::{LibraryBackend, TrustTier};
use crate::descriptor::{PluginHandle, PluginId, PluginSource};
use crate::error::AdaptorError;

/// Log target for registry operations.
pub(crate) const REGISTRY_TARGET: &str = "adaptor_plugins::registry";

/// Outcome of a plugin directory scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Libraries loaded and registered.
    pub loaded: usize,
    /// Regular files that failed to load.
    pub failed: usize,
}

/// Plugins registered with one adaptor.
#[derive(Debug)]
pub struct PluginRegistry {
    capability: Capability,
    call_timeout: Duration,
    plugins: Mutex<Vec<PluginHandle>>,
}

impl PluginRegistry {
    /// Creates an empty registry for `capability`.
    #[must_use]
    pub const fn new(capability: Capability, call_timeout: Duration) -> Self {
        Self {
            capability,
            call_timeout,
            plugins: Mutex::new(Vec::new()),
        }
    }

    /// Capability every registered plugin serves.
    #[must_use]
    pub const fn capability(&self) -> Capability {
        self.capability
    }

    /// Deadline given to plugins loaded by this registry.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Registers a plugin.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Create`] if the plugin serves another
    /// capability or its URI is already registered.
    pub fn add(&self, handle: PluginHandle) -> Result<(), AdaptorError> {
        if handle.capability() != self.capability {
            return Err(AdaptorError::create(format!(
                "plugin '{}' serves {}, not {}",
                handle.uri(),
                handle.capability(),
                self.capability
            )));
        }
        let mut plugins = self.lock();
        if plugins.iter().any(|existing| existing.uri() == handle.uri()) {
            drop(plugins);
            return Err(AdaptorError::create(format!(
                "plugin '{}' is already registered",
                handle.uri()
            )));
        }
        debug!(
            target: REGISTRY_TARGET,
            capability = %self.capability,
            plugin = %handle.uri(),
            id = %handle.id(),
            tier = %handle.tier(),
            path = %handle.path(),
            "plugin registered"
        );
        plugins.push(handle);
        Ok(())
    }

    /// Loads an in-process plugin library and registers it.
    ///
    /// The registry is unchanged when any step fails.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Create`] if the library cannot be loaded,
    /// serves another capability, or duplicates a registered URI.
    pub fn load(&self, path: &Utf8Path) -> Result<PluginHandle, AdaptorError> {
        let backend = LibraryBackend::load(path)?;
        let source = PluginSource {
            uri: backend.uri().to_owned(),
            path: path.to_path_buf(),
            capability: backend.capability(),
            tier: TrustTier::InProcess,
        };
        let handle = PluginHandle::new(source, Box::new(backend), self.call_timeout);
        self.add(handle.clone())?;
        Ok(handle)
    }

    /// Loads every regular file in `dir` as an in-process plugin.
    ///
    /// Entries are visited in name order. Failures of individual libraries
    /// are logged and counted; they do not stop the scan.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::NotFound`] if `dir` does not exist, or
    /// [`AdaptorError::Create`] if it cannot be listed.
    pub fn load_plugins_from_directory(
        &self,
        dir: &Utf8Path,
    ) -> Result<ScanSummary, AdaptorError> {
        let entries = dir.read_dir_utf8().map_err(|error| scan_error(dir, error))?;
        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => paths.push(entry.into_path()),
                Err(error) => warn!(
                    target: REGISTRY_TARGET,
                    dir = %dir,
                    error = %error,
                    "skipping unreadable directory entry"
                ),
            }
        }
        paths.sort();

        let mut summary = ScanSummary::default();
        for path in paths {
            if !fs::metadata(&path).is_ok_and(|metadata| metadata.is_file()) {
                debug!(target: REGISTRY_TARGET, path = %path, "skipping non-regular entry");
                continue;
            }
            match self.load(&path) {
                Ok(_) => summary.loaded += 1,
                Err(error) => {
                    summary.failed += 1;
                    warn!(
                        target: REGISTRY_TARGET,
                        capability = %self.capability,
                        path = %path,
                        error = %error,
                        "failed to load plugin"
                    );
                }
            }
        }
        info!(
            target: REGISTRY_TARGET,
            capability = %self.capability,
            dir = %dir,
            loaded = summary.loaded,
            failed = summary.failed,
            "plugin directory scanned"
        );
        Ok(summary)
    }

    /// Returns a new reference to the plugin registered under `uri`.
    #[must_use]
    pub fn find_by_uri(&self, uri: &str) -> Option<PluginHandle> {
        self.lock().iter().find(|handle| handle.uri() == uri).cloned()
    }

    /// Returns a new reference to every registered plugin.
    #[must_use]
    pub fn list(&self) -> Vec<PluginHandle> {
        self.lock().clone()
    }

    /// Returns `true` if `uri` is registered.
    #[must_use]
    pub fn has(&self, uri: &str) -> bool {
        self.lock().iter().any(|handle| handle.uri() == uri)
    }

    /// Drops the registry's reference to the plugin under `uri`.
    ///
    /// The plugin is destroyed once every outstanding handle is gone.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::NotFound`] if `uri` is not registered.
    pub fn remove(&self, uri: &str) -> Result<(), AdaptorError> {
        let removed = self.take(|handle| handle.uri() == uri).ok_or_else(|| {
            AdaptorError::NotFound {
                name: uri.to_owned(),
            }
        })?;
        debug!(
            target: REGISTRY_TARGET,
            capability = %self.capability,
            plugin = %removed.uri(),
            remaining_refs = removed.ref_count().saturating_sub(1),
            "plugin unregistered"
        );
        Ok(())
    }

    /// Drops the registry's reference to the plugin with `id`, returning its
    /// URI. A plugin loaded again under the same URI is left alone.
    #[must_use]
    pub fn remove_by_id(&self, id: PluginId) -> Option<String> {
        let removed = self.take(|handle| handle.id() == id)?;
        Some(removed.uri().to_owned())
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn take(&self, predicate: impl Fn(&PluginHandle) -> bool) -> Option<PluginHandle> {
        let mut plugins = self.lock();
        let index = plugins.iter().position(predicate)?;
        Some(plugins.remove(index))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PluginHandle>> {
        self.plugins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn scan_error(dir: &Utf8Path, error: io::Error) -> AdaptorError {
    if error.kind() == io::ErrorKind::NotFound {
        AdaptorError::NotFound {
            name: dir.to_string(),
        }
    } else {
        AdaptorError::create_io(format!("failed to list plugin directory '{dir}'"), error)
    }
}
