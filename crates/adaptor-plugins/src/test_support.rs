//! Stub plugins and pipe harnesses shared by the unit tests.

use std::io::{PipeReader, PipeWriter, pipe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use adaptor_config::Capability;

use crate::collector::{PluginDispatcher, run_collector};
use crate::forked::{ForkedBackend, PluginChannel};
use crate::framing::FramingError;
use crate::message::Param;
use crate::operation::Operation;
use crate::plugin::{CapabilityPlugin, ContextState, Credentials, PluginFailure};

pub(crate) const TOKEN: &str = "token-abc";
pub(crate) const REFRESHED_TOKEN: &str = "token-refreshed";

/// Counters observed by tests after the plugin has moved into a dispatcher.
#[derive(Debug, Default)]
pub(crate) struct StubCounters {
    pub(crate) logins: AtomicUsize,
    pub(crate) created: AtomicUsize,
    pub(crate) destroyed: AtomicUsize,
}

impl StubCounters {
    pub(crate) fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Auth plugin that issues [`TOKEN`] on login.
pub(crate) struct StubAuthPlugin {
    uri: String,
    counters: Arc<StubCounters>,
    operations: Vec<Operation>,
}

impl StubAuthPlugin {
    pub(crate) fn new(uri: &str) -> (Self, Arc<StubCounters>) {
        let counters = Arc::new(StubCounters::default());
        let plugin = Self {
            uri: uri.to_owned(),
            counters: Arc::clone(&counters),
            operations: vec![
                Operation::CreateContext,
                Operation::DestroyContext,
                Operation::IsAuth,
                Operation::Join,
                Operation::Login,
                Operation::Refresh,
            ],
        };
        (plugin, counters)
    }

    pub(crate) fn without(mut self, operation: Operation) -> Self {
        self.operations.retain(|candidate| *candidate != operation);
        self
    }

    pub(crate) fn dispatcher(uri: &str) -> (PluginDispatcher, Arc<StubCounters>) {
        let (plugin, counters) = Self::new(uri);
        let dispatcher = PluginDispatcher::new(Box::new(plugin)).expect("stub plugin is valid");
        (dispatcher, counters)
    }
}

impl CapabilityPlugin for StubAuthPlugin {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn capability(&self) -> Capability {
        Capability::Auth
    }

    fn operations(&self) -> &[Operation] {
        &self.operations
    }

    fn create_context(&mut self, credentials: Credentials) -> Result<ContextState, PluginFailure> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(ContextState::new(credentials))
    }

    fn destroy_context(&mut self, state: ContextState) -> Result<(), PluginFailure> {
        drop(state);
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn invoke(
        &mut self,
        operation: Operation,
        state: &mut ContextState,
        params: &[Param],
    ) -> Result<Vec<Param>, PluginFailure> {
        match operation {
            Operation::IsAuth => Ok(vec![Param::from(state.access_token().is_some())]),
            Operation::Join => Ok(params.to_vec()),
            Operation::Login => {
                self.counters.logins.fetch_add(1, Ordering::SeqCst);
                state.set_access_token(TOKEN);
                Ok(vec![Param::from(TOKEN)])
            }
            Operation::Refresh => {
                if state.access_token().is_none() {
                    return Err(PluginFailure::Internal {
                        code: 401,
                        message: String::from("not logged in"),
                    });
                }
                state.set_access_token(REFRESHED_TOKEN);
                Ok(vec![Param::from(REFRESHED_TOKEN)])
            }
            _ => Err(PluginFailure::Unsupported),
        }
    }
}

/// Far end of a pipe-connected plugin running a collector on a thread.
pub(crate) struct CollectorThread {
    pub(crate) handle: JoinHandle<Result<u64, FramingError>>,
}

/// Runs `dispatcher` behind a forked-style channel without spawning a
/// process.
pub(crate) fn spawn_collector(
    label: &str,
    mut dispatcher: PluginDispatcher,
) -> (ForkedBackend, PluginChannel, CollectorThread) {
    let (mut request_reader, request_writer) = pipe().expect("request pipe");
    let (reply_reader, mut reply_writer) = pipe().expect("reply pipe");
    let handle = thread::spawn(move || {
        run_collector(&mut request_reader, &mut reply_writer, &mut dispatcher)
    });
    let (backend, channel) =
        ForkedBackend::from_channels(label, reply_reader, request_writer).expect("broker");
    (backend, channel, CollectorThread { handle })
}

/// Plugin-side pipe ends held by a test that plays the plugin by hand.
pub(crate) struct RawPeer {
    pub(crate) requests: PipeReader,
    pub(crate) replies: PipeWriter,
}

/// Builds a forked-style channel whose far end is driven by the test.
pub(crate) fn raw_channel(label: &str) -> (ForkedBackend, PluginChannel, RawPeer) {
    let (requests, request_writer) = pipe().expect("request pipe");
    let (reply_reader, replies) = pipe().expect("reply pipe");
    let (backend, channel) =
        ForkedBackend::from_channels(label, reply_reader, request_writer).expect("broker");
    (backend, channel, RawPeer { requests, replies })
}

/// Polls `condition` until it holds or two seconds pass.
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
