//! In-process backend over the C ABI in [`crate::abi`].

use std::ffi::{CStr, CString};
use std::fmt;
use std::time::Duration;

use adaptor_config::Capability;
use camino::Utf8Path;
use libloading::Library;
use tracing::debug;

use crate::abi::{ABI_VERSION, CallFn, ENTRY_SYMBOL, EntryFn, ReleaseFn};
use crate::backend::PluginBackend;
use crate::collector::RequestHandler;
use crate::error::AdaptorError;
use crate::message::WireMessage;

/// Log target for in-process plugin libraries.
pub(crate) const LIBRARY_TARGET: &str = "adaptor_plugins::library";

/// Plugin reached through the vtable of a loaded library.
///
/// Field order matters: the library is dropped last so the function
/// pointers never outlive the code they point into.
pub struct LibraryBackend {
    uri: String,
    capability: Capability,
    call: CallFn,
    release: ReleaseFn,
    library: Option<Library>,
}

impl LibraryBackend {
    /// Opens the library at `path` and binds its entry symbol.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Create`] if the library cannot be opened,
    /// the entry symbol is missing, or the vtable it returns is invalid.
    pub fn load(path: &Utf8Path) -> Result<Self, AdaptorError> {
        // SAFETY: loading runs the library's initialisers. Only libraries
        // from the configured plugin directories are loaded in-process.
        let library = unsafe { Library::new(path.as_std_path()) }.map_err(|error| {
            AdaptorError::create(format!("failed to open plugin library '{path}': {error}"))
        })?;
        // SAFETY: the entry symbol has the `EntryFn` signature by contract.
        let entry = unsafe { library.get::<EntryFn>(ENTRY_SYMBOL) }
            .map(|symbol| *symbol)
            .map_err(|error| {
                AdaptorError::create(format!(
                    "plugin library '{path}' has no entry symbol: {error}"
                ))
            })?;
        // SAFETY: `entry` came from `library`, which the backend keeps alive.
        let backend = unsafe { Self::bind(entry, Some(library)) }?;
        debug!(
            target: LIBRARY_TARGET,
            path = %path,
            uri = %backend.uri,
            capability = %backend.capability,
            "plugin library loaded"
        );
        Ok(backend)
    }

    /// Binds an entry function linked into the running binary.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Create`] if the vtable is invalid.
    ///
    /// # Safety
    ///
    /// `entry` must follow the contract of [`crate::abi::EntryFn`].
    pub unsafe fn from_entry(entry: EntryFn) -> Result<Self, AdaptorError> {
        // SAFETY: forwarded from the caller.
        unsafe { Self::bind(entry, None) }
    }

    unsafe fn bind(entry: EntryFn, library: Option<Library>) -> Result<Self, AdaptorError> {
        // SAFETY: the entry function returns null or a pointer to a vtable
        // that lives as long as the library.
        let vtable = unsafe { entry().as_ref() }
            .ok_or_else(|| AdaptorError::create("plugin entry returned no vtable"))?;
        if vtable.abi_version != ABI_VERSION {
            return Err(AdaptorError::create(format!(
                "plugin ABI version {} does not match {ABI_VERSION}",
                vtable.abi_version
            )));
        }
        let capability = Capability::from_code(vtable.capability).ok_or_else(|| {
            AdaptorError::create(format!("unknown capability code {}", vtable.capability))
        })?;
        if vtable.uri.is_null() {
            return Err(AdaptorError::create("plugin vtable has no uri"));
        }
        // SAFETY: checked non-null above; the string is NUL-terminated and
        // owned by the library.
        let uri = unsafe { CStr::from_ptr(vtable.uri) }
            .to_str()
            .map_err(|_| AdaptorError::create("plugin uri is not valid UTF-8"))?
            .to_owned();
        Ok(Self {
            uri,
            capability,
            call: vtable.call,
            release: vtable.release,
            library,
        })
    }

    /// Plugin URI published in the vtable.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Capability published in the vtable.
    #[must_use]
    pub const fn capability(&self) -> Capability {
        self.capability
    }

    /// Sends one request and returns the raw reply, failed status included.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Channel`] when the plugin returns no reply,
    /// and [`AdaptorError::Codec`] when either side is not a valid message.
    pub fn exchange(&self, request: &WireMessage) -> Result<WireMessage, AdaptorError> {
        let encoded = CString::new(request.encode_string()?)
            .map_err(|_| AdaptorError::invalid_argument("request contains a NUL byte"))?;
        // SAFETY: `encoded` is NUL-terminated and outlives the call.
        let reply = unsafe { (self.call)(encoded.as_ptr()) };
        if reply.is_null() {
            return Err(AdaptorError::channel(format!(
                "plugin '{}' returned no reply",
                self.uri
            )));
        }
        // SAFETY: non-null replies are NUL-terminated and stay valid until
        // released.
        let decoded = WireMessage::decode(unsafe { CStr::from_ptr(reply) }.to_bytes());
        // SAFETY: `reply` came from this plugin's `call` and is released once.
        unsafe { (self.release)(reply) };
        decoded
    }
}

impl PluginBackend for LibraryBackend {
    fn call(&self, request: WireMessage, _deadline: Duration) -> Result<WireMessage, AdaptorError> {
        self.exchange(&request)?.into_result()
    }
}

impl RequestHandler for LibraryBackend {
    fn handle(&mut self, request: &WireMessage) -> WireMessage {
        self.exchange(request)
            .unwrap_or_else(|error| WireMessage::reply_to(request).with_error(&error))
    }
}

impl fmt::Debug for LibraryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryBackend")
            .field("uri", &self.uri)
            .field("capability", &self.capability)
            .field("dynamic", &self.library.is_some())
            .finish_non_exhaustive()
    }
}
