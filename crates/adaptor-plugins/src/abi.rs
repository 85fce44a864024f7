//! C ABI shared by the adaptor and in-process plugin libraries.
//!
//! A plugin library exports one symbol, [`ENTRY_SYMBOL`], returning a
//! pointer to a static [`PluginVtable`]. Requests and replies cross the
//! boundary as NUL-terminated JSON wire messages; every reply string is
//! handed back through `release` so it is freed by the allocator that
//! created it. Plugin crates generate all of this with
//! [`crate::export_plugin!`].

use std::ffi::{CStr, CString, c_char};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Mutex, PoisonError};

use tracing::error;

use crate::collector::{PluginDispatcher, RequestHandler};
use crate::context::ContextId;
use crate::error::AdaptorError;
use crate::message::{FunctionName, WireMessage, salvage_request_id};
use crate::plugin::CapabilityPlugin;

/// Log target for ABI boundary events.
pub(crate) const ABI_TARGET: &str = "adaptor_plugins::abi";

/// Layout version of [`PluginVtable`].
pub const ABI_VERSION: u32 = 1;

/// NUL-terminated name of the entry symbol.
pub const ENTRY_SYMBOL: &[u8] = b"adaptor_plugin_entry\0";

/// Handles one NUL-terminated request, returning an owned reply or null.
pub type CallFn = unsafe extern "C" fn(request: *const c_char) -> *mut c_char;

/// Frees a reply returned by [`CallFn`].
pub type ReleaseFn = unsafe extern "C" fn(reply: *mut c_char);

/// Signature of the entry symbol.
pub type EntryFn = unsafe extern "C" fn() -> *const PluginVtable;

/// Function table published by a plugin library.
#[repr(C)]
#[derive(Debug)]
pub struct PluginVtable {
    /// Must equal [`ABI_VERSION`].
    pub abi_version: u32,
    /// [`adaptor_config::Capability::code`] of the plugin.
    pub capability: u32,
    /// NUL-terminated plugin URI, valid for the life of the library.
    pub uri: *const c_char,
    /// Request handler.
    pub call: CallFn,
    /// Reply destructor.
    pub release: ReleaseFn,
}

// SAFETY: `uri` points at an immutable string owned by the exporting
// `ExportedPlugin`, which lives in a static for the rest of the process.
unsafe impl Send for PluginVtable {}
// SAFETY: see the `Send` impl; the table is never mutated after creation.
unsafe impl Sync for PluginVtable {}

/// Plugin state behind an exported vtable.
///
/// Created once per library by [`crate::export_plugin!`].
pub struct ExportedPlugin {
    dispatcher: Mutex<PluginDispatcher>,
    vtable: PluginVtable,
    uri: CString,
}

impl ExportedPlugin {
    /// Builds the plugin and its vtable.
    ///
    /// Returns `None`, after logging, when the constructor panics or the
    /// plugin is not a valid capability implementation.
    pub fn new<F>(constructor: F, call: CallFn, release: ReleaseFn) -> Option<Self>
    where
        F: FnOnce() -> Box<dyn CapabilityPlugin>,
    {
        let Ok(plugin) = panic::catch_unwind(AssertUnwindSafe(constructor)) else {
            error!(target: ABI_TARGET, "plugin constructor panicked");
            return None;
        };
        let dispatcher = match PluginDispatcher::new(plugin) {
            Ok(dispatcher) => dispatcher,
            Err(error) => {
                error!(target: ABI_TARGET, error = %error, "plugin rejected");
                return None;
            }
        };
        let Ok(uri) = CString::new(dispatcher.uri()) else {
            error!(target: ABI_TARGET, "plugin uri contains a NUL byte");
            return None;
        };
        let vtable = PluginVtable {
            abi_version: ABI_VERSION,
            capability: dispatcher.capability().code(),
            uri: uri.as_ptr(),
            call,
            release,
        };
        Some(Self {
            dispatcher: Mutex::new(dispatcher),
            vtable,
            uri,
        })
    }

    /// Plugin URI.
    #[must_use]
    pub fn uri(&self) -> &CStr {
        self.uri.as_c_str()
    }

    /// Pointer returned from the entry symbol.
    #[must_use]
    pub fn vtable_ptr(&self) -> *const PluginVtable {
        ptr::from_ref(&self.vtable)
    }

    /// Handles one raw request.
    ///
    /// Panics inside the plugin are caught here and reported as a null
    /// reply, which the host surfaces as a channel error.
    ///
    /// # Safety
    ///
    /// `request` must be null or a NUL-terminated string that stays valid
    /// for the duration of the call.
    pub unsafe fn call_raw(&self, request: *const c_char) -> *mut c_char {
        if request.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: guaranteed by the caller.
        let text = unsafe { CStr::from_ptr(request) };
        match panic::catch_unwind(AssertUnwindSafe(|| self.handle_text(text))) {
            Ok(reply) => CString::new(reply).map_or(ptr::null_mut(), CString::into_raw),
            Err(_) => {
                error!(
                    target: ABI_TARGET,
                    plugin = ?self.uri,
                    "plugin panicked while handling a request"
                );
                ptr::null_mut()
            }
        }
    }

    fn handle_text(&self, request: &CStr) -> String {
        let decoded = request
            .to_str()
            .map_err(|_| AdaptorError::invalid_argument("request is not valid UTF-8"))
            .and_then(|text| WireMessage::decode(text.as_bytes()));
        let reply = match decoded {
            Ok(message) => self
                .dispatcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .handle(&message),
            Err(error) => {
                let mut placeholder =
                    WireMessage::call(FunctionName::Unknown(String::new()), ContextId::NONE);
                if let Some(request_id) = salvage_request_id(request.to_bytes()) {
                    placeholder.set_request_id(request_id);
                }
                WireMessage::reply_to(&placeholder).with_error(&error)
            }
        };
        reply.encode_string().unwrap_or_default()
    }
}

/// Frees a reply produced by [`ExportedPlugin::call_raw`].
///
/// # Safety
///
/// `reply` must be null or a pointer returned by `call_raw` that has not
/// been released yet.
pub unsafe fn release_reply(reply: *mut c_char) {
    if reply.is_null() {
        return;
    }
    // SAFETY: guaranteed by the caller; the string came from `CString::into_raw`.
    drop(unsafe { CString::from_raw(reply) });
}

/// Exports a plugin through the in-process ABI.
///
/// Takes an expression callable once as
/// `FnOnce() -> Box<dyn CapabilityPlugin>` and defines the
/// `adaptor_plugin_entry` symbol for the crate. Invoke it once per library.
///
/// ```ignore
/// adaptor_plugins::export_plugin!(MyPlugin::boxed);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($constructor:expr) => {
        static ADAPTOR_EXPORTED_PLUGIN: ::std::sync::OnceLock<
            ::std::option::Option<$crate::abi::ExportedPlugin>,
        > = ::std::sync::OnceLock::new();

        fn adaptor_exported_plugin() -> ::std::option::Option<&'static $crate::abi::ExportedPlugin>
        {
            ADAPTOR_EXPORTED_PLUGIN
                .get_or_init(|| {
                    $crate::abi::ExportedPlugin::new(
                        $constructor,
                        adaptor_plugin_call,
                        adaptor_plugin_release,
                    )
                })
                .as_ref()
        }

        unsafe extern "C" fn adaptor_plugin_call(
            request: *const ::std::ffi::c_char,
        ) -> *mut ::std::ffi::c_char {
            adaptor_exported_plugin().map_or(::std::ptr::null_mut(), |plugin| {
                // SAFETY: the host passes a request that outlives the call.
                unsafe { plugin.call_raw(request) }
            })
        }

        unsafe extern "C" fn adaptor_plugin_release(reply: *mut ::std::ffi::c_char) {
            // SAFETY: the host only releases replies returned by `adaptor_plugin_call`.
            unsafe { $crate::abi::release_reply(reply) }
        }

        /// Entry point resolved when the adaptor loads this library.
        #[unsafe(no_mangle)]
        pub extern "C" fn adaptor_plugin_entry() -> *const $crate::abi::PluginVtable {
            adaptor_exported_plugin()
                .map_or(::std::ptr::null(), $crate::abi::ExportedPlugin::vtable_ptr)
        }
    };
}
