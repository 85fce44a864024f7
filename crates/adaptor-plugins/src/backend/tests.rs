//! Tests for the in-process backends and the exported plugin ABI.

use std::ffi::{CStr, CString};
use std::time::Duration;

use adaptor_config::Capability;
use camino::Utf8Path;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::abi::{ABI_VERSION, PluginVtable};
use crate::context::ContextId;
use crate::message::{Param, WireMessage};
use crate::operation::Operation;
use crate::plugin::{CapabilityPlugin, Credentials};
use crate::test_support::{StubAuthPlugin, TOKEN};

const ABI_URI: &str = "stub://abi";
const DEADLINE: Duration = Duration::from_secs(1);

crate::export_plugin!(|| -> Box<dyn CapabilityPlugin> { Box::new(StubAuthPlugin::new(ABI_URI).0) });

#[fixture]
fn library() -> LibraryBackend {
    // SAFETY: `adaptor_plugin_entry` is generated by `export_plugin!` above.
    unsafe { LibraryBackend::from_entry(adaptor_plugin_entry) }.expect("bind exported plugin")
}

fn create_context(backend: &dyn PluginBackend) -> ContextId {
    let request = WireMessage::call(Operation::CreateContext, ContextId::NONE)
        .with_params(Credentials::new("alice", "app", "secret").to_params());
    let reply = backend.call(request, DEADLINE).expect("create context");
    reply
        .param_num(1)
        .and_then(ContextId::from_param)
        .expect("context id in reply")
}

#[test]
fn tier_displays_snake_case() {
    assert_eq!(TrustTier::InProcess.to_string(), "in_process");
    assert_eq!(TrustTier::Forked.to_string(), "forked");
}

#[test]
fn local_backend_runs_login() {
    let (plugin, counters) = StubAuthPlugin::new("stub://local");
    let backend = LocalBackend::from_plugin(Box::new(plugin)).expect("valid plugin");
    assert_eq!(backend.uri(), "stub://local");
    assert_eq!(backend.capability(), Capability::Auth);

    let context = create_context(&backend);
    let reply = backend
        .call(WireMessage::call(Operation::Login, context), DEADLINE)
        .expect("login");

    assert_eq!(reply.param_str(1), Some(TOKEN));
    assert_eq!(counters.logins(), 1);
}

#[test]
fn local_backend_surfaces_failed_status() {
    let (dispatcher, _) = StubAuthPlugin::dispatcher("stub://local");
    let backend = LocalBackend::new(dispatcher);

    let error = backend
        .call(WireMessage::call(Operation::Login, ContextId::from_raw(99)), DEADLINE)
        .expect_err("unknown context");

    assert!(matches!(error, AdaptorError::InvalidArgument { .. }));
}

#[test]
fn local_backend_rejects_plugin_without_login() {
    let (plugin, _) = StubAuthPlugin::new("stub://partial");
    let result = LocalBackend::from_plugin(Box::new(plugin.without(Operation::Login)));

    assert!(matches!(result, Err(AdaptorError::Create { .. })));
}

#[rstest]
fn library_backend_reads_vtable(library: LibraryBackend) {
    assert_eq!(library.uri(), ABI_URI);
    assert_eq!(library.capability(), Capability::Auth);
}

#[rstest]
fn library_backend_round_trips_calls(library: LibraryBackend) {
    let context = create_context(&library);
    let reply = library
        .call(
            WireMessage::call(Operation::Join, context).with_param("room-7"),
            DEADLINE,
        )
        .expect("join");

    assert_eq!(reply.params(), [Param::from("room-7")].as_slice());
}

#[rstest]
fn library_handler_encodes_errors_in_reply(mut library: LibraryBackend) {
    let mut request = WireMessage::call(Operation::Connect, ContextId::NONE);
    request.set_request_id(41);

    let reply = library.handle(&request);

    assert_eq!(reply.request_id(), 41);
    assert!(matches!(
        reply.into_result(),
        Err(AdaptorError::Unsupported { .. })
    ));
}

#[test]
fn exported_vtable_describes_plugin() {
    let vtable: &PluginVtable =
        // SAFETY: the generated entry returns a pointer into a static.
        unsafe { adaptor_plugin_entry().as_ref() }.expect("vtable");

    assert_eq!(vtable.abi_version, ABI_VERSION);
    assert_eq!(vtable.capability, Capability::Auth.code());
    // SAFETY: the vtable uri is a NUL-terminated static string.
    let uri = unsafe { CStr::from_ptr(vtable.uri) };
    assert_eq!(uri.to_str().expect("utf-8"), ABI_URI);
}

#[test]
fn exported_call_answers_malformed_request_with_salvaged_id() {
    let vtable =
        // SAFETY: the generated entry returns a pointer into a static.
        unsafe { adaptor_plugin_entry().as_ref() }.expect("vtable");
    let request = CString::new(r#"{"request_id":12,"message_type":"bogus"}"#).expect("cstring");

    // SAFETY: `request` outlives the call and the reply is released below.
    let reply = unsafe { (vtable.call)(request.as_ptr()) };
    assert!(!reply.is_null());
    // SAFETY: non-null replies are NUL-terminated.
    let decoded = WireMessage::decode(unsafe { CStr::from_ptr(reply) }.to_bytes());
    // SAFETY: `reply` came from `call` and is released once.
    unsafe { (vtable.release)(reply) };

    let decoded = decoded.expect("reply decodes");
    assert_eq!(decoded.request_id(), 12);
    assert!(matches!(
        decoded.into_result(),
        Err(AdaptorError::InvalidArgument { .. })
    ));
}

#[test]
fn exported_call_rejects_null_request() {
    let vtable =
        // SAFETY: the generated entry returns a pointer into a static.
        unsafe { adaptor_plugin_entry().as_ref() }.expect("vtable");

    // SAFETY: null is explicitly allowed by the ABI.
    let reply = unsafe { (vtable.call)(std::ptr::null()) };

    assert!(reply.is_null());
}

#[test]
fn loading_a_non_library_fails_with_create() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("not-a-plugin.so");
    std::fs::write(&path, b"plain text").expect("write file");
    let path = Utf8Path::from_path(&path).expect("utf-8 path");

    let result = LibraryBackend::load(path);

    assert!(matches!(result, Err(AdaptorError::Create { .. })));
}
