//! Crate-level integration and BDD tests.

use std::thread;
use std::time::Duration;

use adaptor_config::Capability;
use camino::Utf8Path;

use crate::adaptor::{Adaptor, AdaptorSettings};
use crate::plugin::Credentials;
use crate::test_support::{StubAuthPlugin, TOKEN, spawn_collector};


#[test]
fn concurrent_logins_share_one_forked_plugin() {
    const CALLERS: usize = 16;
    let settings = AdaptorSettings {
        plugin_dir: Utf8Path::new("/nonexistent/adaptor/auth").to_path_buf(),
        plugin_host: Utf8Path::new("/nonexistent/adaptor-plugin-host").to_path_buf(),
        call_timeout: Duration::from_secs(5),
        listener_wait: Duration::from_millis(50),
    };
    let adaptor = Adaptor::empty(Capability::Auth, settings);
    adaptor.start().expect("start");
    let (dispatcher, counters) = StubAuthPlugin::dispatcher("org.example.auth");
    let (backend, channel, _collector) = spawn_collector("org.example.auth", dispatcher);
    let plugin = adaptor
        .attach_forked(
            "org.example.auth",
            Utf8Path::new("/plugins/libauth.so"),
            backend,
            channel,
        )
        .expect("attach");

    let workers: Vec<_> = (0..CALLERS)
        .map(|caller| {
            let plugin = plugin.clone();
            thread::spawn(move || {
                let user = format!("user-{caller}");
                let mut context = plugin
                    .create_context(&Credentials::new(user, "app", "secret"))
                    .expect("context");
                let token = context.login().expect("login").to_owned();
                let authenticated = context.is_auth().expect("is_auth");
                (context.id(), token, authenticated)
            })
        })
        .collect();
    let mut results: Vec<_> = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker"))
        .collect();

    assert!(results.iter().all(|(_, token, authenticated)| token == TOKEN && *authenticated));
    results.sort_by_key(|(id, _, _)| id.raw());
    results.dedup_by_key(|(id, _, _)| id.raw());
    assert_eq!(results.len(), CALLERS);
    assert_eq!(counters.logins(), CALLERS);
    assert_eq!(counters.destroyed(), CALLERS);
    assert_eq!(plugin.context_count(), 0);
}
