//! Tests for adaptor lifecycle and forked plugin supervision.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use adaptor_config::{Capability, Config};
use camino::{Utf8Path, Utf8PathBuf};
use mockall::mock;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::plugin::Credentials;
use crate::test_support::{StubAuthPlugin, TOKEN, raw_channel, spawn_collector, wait_until};

mock! {
    Upward {}
    impl AdaptorListener for Upward {
        fn plugin_removed(&self, capability: Capability, uri: &str);
    }
}

struct Workspace {
    _dir: TempDir,
    settings: AdaptorSettings,
}

#[fixture]
fn workspace() -> Workspace {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 path");
    let settings = AdaptorSettings {
        plugin_dir: root.join("auth"),
        plugin_host: root.join("missing-plugin-host"),
        call_timeout: Duration::from_secs(2),
        listener_wait: Duration::from_millis(50),
    };
    Workspace { _dir: dir, settings }
}

fn started(workspace: &Workspace) -> Adaptor {
    let adaptor = Adaptor::create(Capability::Auth, workspace.settings.clone());
    adaptor.start().expect("start");
    adaptor
}

#[test]
fn settings_follow_configuration() {
    let config = Config::default();

    let settings = AdaptorSettings::from_config(&config, Capability::Push);

    assert_eq!(settings.plugin_dir, config.plugins_root().join("push"));
    assert_eq!(settings.plugin_host, config.plugin_host());
    assert_eq!(settings.call_timeout, config.call_timeout());
    assert_eq!(settings.listener_wait, config.listener_wait());
}

#[rstest]
fn missing_plugin_directory_leaves_registry_empty(workspace: Workspace) {
    let adaptor = Adaptor::create(Capability::Auth, workspace.settings.clone());

    assert!(adaptor.plugins().is_empty());
    assert_eq!(adaptor.capability(), Capability::Auth);
    assert!(!adaptor.is_started());
}

#[rstest]
fn start_twice_reports_already_started(workspace: Workspace) {
    let adaptor = started(&workspace);

    let error = adaptor.start().expect_err("second start");

    assert!(matches!(
        error,
        AdaptorError::AlreadyStarted { capability: Capability::Auth }
    ));
    assert!(adaptor.is_started());
}

#[rstest]
fn stop_is_idempotent(workspace: Workspace) {
    let adaptor = started(&workspace);

    adaptor.stop().expect("first stop");
    let error = adaptor.stop().expect_err("second stop");

    assert!(matches!(error, AdaptorError::NotStarted { .. }));
    assert!(!adaptor.is_started());
}

#[rstest]
fn stop_without_start_reports_not_started(workspace: Workspace) {
    let adaptor = Adaptor::empty(Capability::Auth, workspace.settings.clone());

    assert!(matches!(
        adaptor.stop(),
        Err(AdaptorError::NotStarted { .. })
    ));
}

#[rstest]
fn adaptor_can_restart(workspace: Workspace) {
    let adaptor = started(&workspace);
    adaptor.stop().expect("stop");

    adaptor.start().expect("restart");

    assert!(adaptor.is_started());
}

#[rstest]
fn load_forked_requires_started_adaptor(workspace: Workspace) {
    let adaptor = Adaptor::empty(Capability::Auth, workspace.settings.clone());

    let error = adaptor
        .load_forked("org.example.auth", Utf8Path::new("/plugins/libauth.so"))
        .expect_err("not started");

    assert!(matches!(error, AdaptorError::NotStarted { .. }));
}

#[rstest]
fn load_forked_with_missing_host_fails_with_create(workspace: Workspace) {
    let adaptor = started(&workspace);

    let error = adaptor
        .load_forked("org.example.auth", Utf8Path::new("/plugins/libauth.so"))
        .expect_err("host is missing");

    assert!(matches!(error, AdaptorError::Create { .. }));
    assert!(!adaptor.has_plugin("org.example.auth"));
}

#[rstest]
fn forked_plugin_serves_login(workspace: Workspace) {
    let adaptor = started(&workspace);
    let (dispatcher, counters) = StubAuthPlugin::dispatcher("org.example.auth");
    let (backend, channel, _collector) = spawn_collector("org.example.auth", dispatcher);
    adaptor
        .attach_forked(
            "org.example.auth",
            Utf8Path::new("/plugins/libauth.so"),
            backend,
            channel,
        )
        .expect("attach");

    let plugin = adaptor.plugin("org.example.auth").expect("registered");
    assert_eq!(plugin.tier(), TrustTier::Forked);
    let mut context = plugin
        .create_context(&Credentials::new("alice", "app", "secret"))
        .expect("context");

    assert_eq!(context.login().expect("login"), TOKEN);
    assert_eq!(counters.logins(), 1);
}

#[rstest]
fn duplicate_forked_uri_is_rejected(workspace: Workspace) {
    let adaptor = started(&workspace);
    let (first, first_channel, _first_peer) = raw_channel("org.example.auth");
    let (second, second_channel, _second_peer) = raw_channel("org.example.auth");
    let path = Utf8Path::new("/plugins/libauth.so");
    adaptor
        .attach_forked("org.example.auth", path, first, first_channel)
        .expect("first attach");

    let error = adaptor
        .attach_forked("org.example.auth", path, second, second_channel)
        .expect_err("duplicate");

    assert!(matches!(error, AdaptorError::Create { .. }));
    assert_eq!(adaptor.plugins().len(), 1);
}

#[rstest]
fn dead_plugin_is_unregistered_and_reported(workspace: Workspace) {
    let adaptor = started(&workspace);
    let mut upward = MockUpward::new();
    upward
        .expect_plugin_removed()
        .withf(|capability, uri| *capability == Capability::Auth && uri == "org.example.auth")
        .times(1)
        .return_const(());
    adaptor.set_listener(Arc::new(upward));
    let (backend, channel, peer) = raw_channel("org.example.auth");
    let plugin = adaptor
        .attach_forked(
            "org.example.auth",
            Utf8Path::new("/plugins/libauth.so"),
            backend,
            channel,
        )
        .expect("attach");

    drop(peer);

    assert!(wait_until(|| !adaptor.has_plugin("org.example.auth")));
    let error = plugin
        .call(crate::message::WireMessage::call(
            crate::operation::Operation::IsAuth,
            crate::context::ContextId::from_raw(1),
        ))
        .expect_err("plugin is dead");
    assert!(matches!(error, AdaptorError::Channel { .. }));
    adaptor.stop().expect("stop joins the listener");
}

#[rstest]
fn cleared_listener_is_not_notified(workspace: Workspace) {
    let adaptor = started(&workspace);
    let mut upward = MockUpward::new();
    upward.expect_plugin_removed().never();
    adaptor.set_listener(Arc::new(upward));
    adaptor.clear_listener();
    let (backend, channel, peer) = raw_channel("org.example.auth");
    adaptor
        .attach_forked(
            "org.example.auth",
            Utf8Path::new("/plugins/libauth.so"),
            backend,
            channel,
        )
        .expect("attach");

    drop(peer);

    assert!(wait_until(|| !adaptor.has_plugin("org.example.auth")));
    adaptor.stop().expect("stop");
}

#[rstest]
fn stop_unregisters_forked_plugins(workspace: Workspace) {
    let adaptor = started(&workspace);
    let (backend, channel, _peer) = raw_channel("org.example.auth");
    let plugin = adaptor
        .attach_forked(
            "org.example.auth",
            Utf8Path::new("/plugins/libauth.so"),
            backend,
            channel,
        )
        .expect("attach");

    adaptor.stop().expect("stop");

    assert!(!adaptor.has_plugin("org.example.auth"));
    assert_eq!(plugin.ref_count(), 1);
}

#[rstest]
fn attach_requires_started_adaptor(workspace: Workspace) {
    let adaptor = Adaptor::empty(Capability::Auth, workspace.settings.clone());
    let (backend, channel, _peer) = raw_channel("org.example.auth");

    let error = adaptor
        .attach_forked(
            "org.example.auth",
            Utf8Path::new("/plugins/libauth.so"),
            backend,
            channel,
        )
        .expect_err("not started");

    assert!(matches!(error, AdaptorError::NotStarted { .. }));
    assert!(adaptor.plugins().is_empty());
}

#[rstest]
fn unload_and_lookup_misses(workspace: Workspace) {
    let adaptor = started(&workspace);
    let (backend, channel, _peer) = raw_channel("org.example.auth");
    adaptor
        .attach_forked(
            "org.example.auth",
            Utf8Path::new("/plugins/libauth.so"),
            backend,
            channel,
        )
        .expect("attach");

    adaptor.unload("org.example.auth").expect("unload");

    assert!(matches!(
        adaptor.unload("org.example.auth"),
        Err(AdaptorError::NotFound { .. })
    ));
    assert!(matches!(
        adaptor.plugin("org.example.auth"),
        Err(AdaptorError::NotFound { .. })
    ));
}

#[rstest]
fn stop_returns_while_a_plugin_is_not_reading(workspace: Workspace) {
    let settings = AdaptorSettings {
        call_timeout: Duration::from_millis(100),
        ..workspace.settings.clone()
    };
    let adaptor = Adaptor::empty(Capability::Auth, settings);
    adaptor.start().expect("start");
    let (backend, channel, _unread) = raw_channel("org.example.auth");
    let plugin = adaptor
        .attach_forked(
            "org.example.auth",
            Utf8Path::new("/plugins/libauth.so"),
            backend,
            channel,
        )
        .expect("attach");
    let payload = "x".repeat(7_900);
    let started = Instant::now();

    let callers: Vec<_> = (0..12)
        .map(|_| {
            let plugin = plugin.clone();
            let payload = payload.clone();
            thread::spawn(move || {
                plugin.call(
                    crate::message::WireMessage::call(
                        crate::operation::Operation::Join,
                        crate::context::ContextId::from_raw(1),
                    )
                    .with_param(payload.as_str()),
                )
            })
        })
        .collect();
    for caller in callers {
        assert!(caller.join().expect("caller").is_err());
    }
    assert!(started.elapsed() < Duration::from_secs(2), "calls overran");

    let (done, stopped) = mpsc::channel();
    thread::spawn(move || {
        done.send(adaptor.stop()).ok();
    });
    let outcome = stopped
        .recv_timeout(Duration::from_secs(3))
        .expect("stop returned in time");
    outcome.expect("clean stop");
    drop(plugin);
}
