//! Synchronous calls over a shared one-way plugin channel.
//!
//! Every forked plugin has one outbound pipe shared by all callers. The
//! broker stamps each request with a fresh id from a monotonic counter,
//! parks a one-shot correlation channel in the pending table under that id,
//! and blocks on it until the listener hands over the matching reply or the
//! deadline passes. Replies may complete in any order.
//!
//! Callers never touch the pipe. Encoded frames go through a bounded queue
//! to a writer thread that owns the write end, so a plugin that stops
//! reading stalls only that thread: calls still end at their deadline and
//! closing the broker never waits on a blocked write.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::AdaptorError;
use crate::framing::{MAX_PAYLOAD, write_frame};
use crate::message::WireMessage;

/// Log target for call broker operations.
pub(crate) const BROKER_TARGET: &str = "adaptor_plugins::broker";

/// Frames that may wait for the writer thread before callers are refused.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

type PendingTable = HashMap<u64, SyncSender<WireMessage>>;

struct Outbound {
    request_id: u64,
    payload: Vec<u8>,
}

/// State shared between callers, the listener, and the writer thread.
struct BrokerState {
    label: String,
    pending: Mutex<PendingTable>,
    alive: AtomicBool,
}

impl BrokerState {
    fn pending_table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_pending(&self, request_id: u64) -> bool {
        self.pending_table().contains_key(&request_id)
    }

    /// Marks the broker dead and drops every waiter, returning how many
    /// calls were still pending.
    fn drain(&self) -> usize {
        let mut pending = self.pending_table();
        self.alive.store(false, Ordering::SeqCst);
        let drained = pending.len();
        pending.clear();
        drained
    }
}

/// Correlates requests written to a plugin with the replies read back.
pub struct CallBroker {
    state: Arc<BrokerState>,
    outbound: Mutex<Option<SyncSender<Outbound>>>,
    next_request: AtomicU64,
}

impl CallBroker {
    /// Creates a broker writing requests to `writer` from a dedicated
    /// thread.
    ///
    /// `label` names the plugin in log events and errors.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Create`] if the writer thread cannot be
    /// spawned.
    pub fn new(
        label: impl Into<String>,
        writer: Box<dyn Write + Send>,
    ) -> Result<Self, AdaptorError> {
        let state = Arc::new(BrokerState {
            label: label.into(),
            pending: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        });
        let (sender, receiver) = mpsc::sync_channel(OUTBOUND_QUEUE_DEPTH);
        let writer_state = Arc::clone(&state);
        thread::Builder::new()
            .name(format!("{}-writer", state.label))
            .spawn(move || write_loop(&writer_state, writer, &receiver))
            .map_err(|source| {
                AdaptorError::create_io(
                    format!("failed to spawn writer thread for '{}'", state.label),
                    source,
                )
            })?;
        Ok(Self {
            state,
            outbound: Mutex::new(Some(sender)),
            next_request: AtomicU64::new(1),
        })
    }

    /// Plugin label used in log events.
    #[must_use]
    pub fn label(&self) -> &str {
        self.state.label.as_str()
    }

    /// Sends `message` and waits up to `deadline` for its reply.
    ///
    /// The reply is returned as received; use [`WireMessage::into_result`]
    /// to turn a failed status into an error.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::InvalidArgument`] when the request does not
    /// fit in one frame, [`AdaptorError::Channel`] when the broker is
    /// closed, its outbound queue is full, or the channel dies while
    /// waiting, and [`AdaptorError::Timeout`] when the deadline passes. The
    /// pending entry is released on every path.
    pub fn call(
        &self,
        mut message: WireMessage,
        deadline: Duration,
    ) -> Result<WireMessage, AdaptorError> {
        let function = message.function_name().to_string();
        let (sender, receiver) = mpsc::sync_channel(1);
        let request_id = self.register(sender)?;
        message.set_request_id(request_id);

        if let Err(error) = self.enqueue(request_id, &message) {
            self.forget(request_id);
            return Err(error);
        }
        debug!(
            target: BROKER_TARGET,
            plugin = %self.label(),
            request_id,
            function = %function,
            "request queued"
        );

        match receiver.recv_timeout(deadline) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                self.forget(request_id);
                warn!(
                    target: BROKER_TARGET,
                    plugin = %self.label(),
                    request_id,
                    function = %function,
                    deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    "plugin call timed out"
                );
                Err(AdaptorError::timeout(function, deadline))
            }
            Err(RecvTimeoutError::Disconnected) => Err(AdaptorError::channel(format!(
                "channel to plugin '{}' closed while '{function}' was pending",
                self.label()
            ))),
        }
    }

    /// Hands a reply to the call waiting on its request id.
    ///
    /// Replies nobody waits for (the call timed out, or the id was never
    /// issued) are logged as protocol anomalies and dropped.
    pub fn complete(&self, reply: WireMessage) {
        let request_id = reply.request_id();
        let waiter = self.state.pending_table().remove(&request_id);
        match waiter {
            Some(sender) => {
                if sender.try_send(reply).is_err() {
                    debug!(
                        target: BROKER_TARGET,
                        plugin = %self.label(),
                        request_id,
                        "caller stopped waiting before the reply arrived"
                    );
                }
            }
            None => warn!(
                target: BROKER_TARGET,
                plugin = %self.label(),
                request_id,
                function = %reply.function_name(),
                "reply does not match a pending request"
            ),
        }
    }

    /// Closes the broker and wakes every waiting call with a channel error.
    ///
    /// Never blocks on the plugin: a write stuck on a full pipe is left to
    /// the writer thread.
    pub fn fail_all(&self, reason: &str) {
        let drained = self.state.drain();
        self.close();
        if drained > 0 {
            warn!(
                target: BROKER_TARGET,
                plugin = %self.label(),
                pending = drained,
                reason,
                "failing pending plugin calls"
            );
        }
    }

    /// Closes the outbound queue. The plugin sees end of stream once the
    /// writer thread has flushed what it already holds.
    pub fn close(&self) {
        let sender = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
    }

    /// Number of calls waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.state.pending_table().len()
    }

    /// Returns `false` once the broker has been failed, either by
    /// [`CallBroker::fail_all`] or by a write error.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    fn register(&self, sender: SyncSender<WireMessage>) -> Result<u64, AdaptorError> {
        let mut pending = self.state.pending_table();
        if !self.is_alive() {
            return Err(self.closed());
        }
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        pending.insert(request_id, sender);
        Ok(request_id)
    }

    fn forget(&self, request_id: u64) {
        self.state.pending_table().remove(&request_id);
    }

    fn enqueue(&self, request_id: u64, message: &WireMessage) -> Result<(), AdaptorError> {
        let payload = message.encode()?;
        if payload.len() > MAX_PAYLOAD {
            return Err(AdaptorError::invalid_argument(format!(
                "request of {} bytes exceeds the frame limit",
                payload.len()
            )));
        }
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = outbound.as_ref() else {
            return Err(self.closed());
        };
        match sender.try_send(Outbound {
            request_id,
            payload,
        }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AdaptorError::channel(format!(
                "plugin '{}' is not draining its channel; \
                 {OUTBOUND_QUEUE_DEPTH} requests queued",
                self.label()
            ))),
            Err(TrySendError::Disconnected(_)) => Err(self.closed()),
        }
    }

    fn closed(&self) -> AdaptorError {
        AdaptorError::channel(format!("channel to plugin '{}' is closed", self.label()))
    }
}

impl fmt::Debug for CallBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBroker")
            .field("label", &self.label())
            .field("alive", &self.is_alive())
            .field("pending", &self.pending_calls())
            .finish_non_exhaustive()
    }
}

/// Drains the outbound queue into the plugin's write end.
///
/// Frames whose call already ended are skipped. A write error fails every
/// pending call. The write end is dropped when the queue closes, which is
/// how the plugin learns the channel is gone.
fn write_loop(
    state: &BrokerState,
    mut writer: Box<dyn Write + Send>,
    queue: &Receiver<Outbound>,
) {
    while let Ok(Outbound {
        request_id,
        payload,
    }) = queue.recv()
    {
        if !state.is_pending(request_id) {
            debug!(
                target: BROKER_TARGET,
                plugin = %state.label,
                request_id,
                "skipping request whose call already ended"
            );
            continue;
        }
        if let Err(error) = write_frame(writer.as_mut(), &payload) {
            let failed = state.drain();
            warn!(
                target: BROKER_TARGET,
                plugin = %state.label,
                request_id,
                failed,
                error = %error,
                "plugin channel write failed"
            );
            break;
        }
    }
    drop(writer);
    debug!(target: BROKER_TARGET, plugin = %state.label, "plugin writer finished");
}
