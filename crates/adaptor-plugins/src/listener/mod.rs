//! Parent-side multiplexer for forked plugin channels.
//!
//! One background thread per started adaptor waits with `poll(2)` on a
//! control pipe plus the read end of every registered plugin. Each wake
//! services every ready channel once; channels that reached end of stream
//! or carried a corrupt frame are queued and removed only at the end of the
//! pass, so the polled set stays stable within one iteration.
//!
//! The control pipe carries framed text commands:
//!
//! - `append;<slot>` claims a channel parked in the registration table;
//! - `stop;` fails every remaining call and ends the thread.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, PipeReader, PipeWriter, Read};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use adaptor_config::Capability;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, info, warn};

use crate::descriptor::PluginId;
use crate::error::AdaptorError;
use crate::forked::PluginChannel;
use crate::framing::{ReadOutcome, read_frame, write_frame};
use crate::message::{MessageType, WireMessage};

/// Log target for listener operations.
pub(crate) const LISTENER_TARGET: &str = "adaptor_plugins::listener";

const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Readable, pollable byte source a plugin channel is read from.
pub trait FrameSource: Read + AsFd + Send {}

impl<T> FrameSource for T where T: Read + AsFd + Send {}

/// Called from the listener thread when a plugin channel dies.
pub type DeathHook = Arc<dyn Fn(PluginId) + Send + Sync>;

/// A plugin channel awaiting registration with the listener.
pub struct ChannelSlot {
    plugin: PluginId,
    label: String,
    channel: PluginChannel,
}

impl ChannelSlot {
    /// Associates a plugin channel with the plugin it belongs to.
    pub fn new(plugin: PluginId, label: impl Into<String>, channel: PluginChannel) -> Self {
        Self {
            plugin,
            label: label.into(),
            channel,
        }
    }
}

impl fmt::Debug for ChannelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSlot")
            .field("plugin", &self.plugin)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlCommand {
    Append(u64),
    Stop,
}

impl ControlCommand {
    fn encode(self) -> String {
        match self {
            Self::Append(slot) => format!("append;{slot}"),
            Self::Stop => String::from("stop;"),
        }
    }

    fn parse(text: &str) -> Option<Self> {
        let (verb, argument) = text.split_once(';')?;
        match verb {
            "append" => argument.trim().parse().ok().map(Self::Append),
            "stop" if argument.trim().is_empty() => Some(Self::Stop),
            _ => None,
        }
    }
}

type Registrations = Arc<Mutex<HashMap<u64, ChannelSlot>>>;

/// Handle to a running listener thread.
pub struct ListenerHandle {
    capability: Capability,
    control: Mutex<PipeWriter>,
    registrations: Registrations,
    next_slot: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Starts the listener thread.
    ///
    /// `wait` bounds one multiplexing pass; the wait re-arms after every
    /// wake. `on_dead` runs on the listener thread for every channel that
    /// dies while the listener is running.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Create`] if the control pipe or the thread
    /// cannot be created.
    pub fn spawn(
        capability: Capability,
        wait: Duration,
        on_dead: DeathHook,
    ) -> Result<Self, AdaptorError> {
        let (control_reader, control_writer) = io::pipe()
            .map_err(|source| AdaptorError::create_io("failed to create control pipe", source))?;
        let registrations: Registrations = Arc::new(Mutex::new(HashMap::new()));
        let worker = ListenerLoop {
            capability,
            wait: PollTimeout::try_from(wait).unwrap_or(PollTimeout::MAX),
            control: control_reader,
            registrations: Arc::clone(&registrations),
            active: Vec::new(),
            on_dead,
        };
        let thread = thread::Builder::new()
            .name(format!("{capability}-listener"))
            .spawn(move || worker.run())
            .map_err(|source| {
                AdaptorError::create_io("failed to spawn plugin listener thread", source)
            })?;
        Ok(Self {
            capability,
            control: Mutex::new(control_writer),
            registrations,
            next_slot: AtomicU64::new(1),
            thread: Some(thread),
        })
    }

    /// Hands a plugin channel to the listener.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Channel`] if the listener can no longer be
    /// reached; the channel is dropped in that case.
    pub fn register(&self, slot: ChannelSlot) -> Result<(), AdaptorError> {
        let id = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let label = slot.label.clone();
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slot);
        if let Err(error) = self.send(ControlCommand::Append(id)) {
            let unclaimed = self
                .registrations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            if let Some(parked) = unclaimed {
                parked.channel.broker.fail_all("listener unreachable");
            }
            return Err(error);
        }
        debug!(
            target: LISTENER_TARGET,
            capability = %self.capability,
            slot = id,
            plugin = %label,
            "plugin channel handed to listener"
        );
        Ok(())
    }

    /// Sends `stop;` and joins the thread.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Channel`] if the thread panicked.
    pub fn stop(mut self) -> Result<(), AdaptorError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), AdaptorError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if let Err(error) = self.send(ControlCommand::Stop) {
            warn!(
                target: LISTENER_TARGET,
                capability = %self.capability,
                error = %error,
                "failed to deliver stop command"
            );
        }
        thread
            .join()
            .map_err(|_| AdaptorError::channel("plugin listener thread panicked"))
    }

    fn send(&self, command: ControlCommand) -> Result<(), AdaptorError> {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut *control, command.encode().as_bytes()).map_err(AdaptorError::from)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            error!(
                target: LISTENER_TARGET,
                capability = %self.capability,
                error = %error,
                "plugin listener did not shut down cleanly"
            );
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("capability", &self.capability)
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

struct ActiveSlot {
    id: u64,
    slot: ChannelSlot,
}

enum ControlOutcome {
    Continue,
    Stop,
}

struct ListenerLoop {
    capability: Capability,
    wait: PollTimeout,
    control: PipeReader,
    registrations: Registrations,
    active: Vec<ActiveSlot>,
    on_dead: DeathHook,
}

impl ListenerLoop {
    fn run(mut self) {
        info!(
            target: LISTENER_TARGET,
            capability = %self.capability,
            "plugin listener active"
        );
        loop {
            let ready = match self.poll_ready() {
                Ok(Some(ready)) => ready,
                Ok(None) | Err(Errno::EINTR) => continue,
                Err(errno) => {
                    error!(
                        target: LISTENER_TARGET,
                        capability = %self.capability,
                        error = %errno,
                        "poll failed"
                    );
                    thread::sleep(ERROR_BACKOFF);
                    continue;
                }
            };

            let dead: Vec<usize> = ready
                .slots
                .iter()
                .enumerate()
                .filter(|(_, is_ready)| **is_ready)
                .filter_map(|(index, _)| (!self.service(index)).then_some(index))
                .collect();
            self.remove_dead(&dead);

            if ready.control && matches!(self.read_control(), ControlOutcome::Stop) {
                break;
            }
        }
        self.shutdown();
    }

    /// Waits for readiness. Returns `None` when the wait elapsed.
    fn poll_ready(&self) -> Result<Option<Readiness>, Errno> {
        let interest = PollFlags::POLLIN;
        let mut fds = Vec::with_capacity(self.active.len() + 1);
        fds.push(PollFd::new(self.control.as_fd(), interest));
        fds.extend(
            self.active
                .iter()
                .map(|active| PollFd::new(active.slot.channel.reader.as_fd(), interest)),
        );

        if poll(&mut fds, self.wait)? == 0 {
            return Ok(None);
        }
        let mut flags = fds.iter().map(is_ready);
        let control = flags.next().unwrap_or(false);
        Ok(Some(Readiness {
            control,
            slots: flags.collect(),
        }))
    }

    /// Reads one frame from a ready channel. Returns `false` when the
    /// channel is dead.
    fn service(&mut self, index: usize) -> bool {
        let Some(active) = self.active.get_mut(index) else {
            return true;
        };
        let slot = &mut active.slot;
        match read_frame(&mut slot.channel.reader) {
            Ok(ReadOutcome::Frame(bytes)) => {
                route(slot, &bytes);
                true
            }
            Ok(ReadOutcome::EndOfStream) => {
                info!(
                    target: LISTENER_TARGET,
                    capability = %self.capability,
                    slot = active.id,
                    plugin = %slot.label,
                    "plugin channel closed"
                );
                false
            }
            Err(error) => {
                warn!(
                    target: LISTENER_TARGET,
                    capability = %self.capability,
                    slot = active.id,
                    plugin = %slot.label,
                    error = %error,
                    "plugin channel corrupted"
                );
                false
            }
        }
    }

    fn remove_dead(&mut self, dead: &[usize]) {
        for index in dead.iter().rev() {
            if *index >= self.active.len() {
                continue;
            }
            let removed = self.active.remove(*index);
            removed.slot.channel.broker.fail_all("plugin channel closed");
            debug!(
                target: LISTENER_TARGET,
                capability = %self.capability,
                slot = removed.id,
                plugin = %removed.slot.label,
                "plugin channel removed"
            );
            (self.on_dead)(removed.slot.plugin);
        }
    }

    fn read_control(&mut self) -> ControlOutcome {
        let bytes = match read_frame(&mut self.control) {
            Ok(ReadOutcome::Frame(bytes)) => bytes,
            Ok(ReadOutcome::EndOfStream) => {
                debug!(
                    target: LISTENER_TARGET,
                    capability = %self.capability,
                    "control channel closed"
                );
                return ControlOutcome::Stop;
            }
            Err(error) => {
                error!(
                    target: LISTENER_TARGET,
                    capability = %self.capability,
                    error = %error,
                    "control channel corrupted"
                );
                return ControlOutcome::Stop;
            }
        };

        let text = String::from_utf8_lossy(&bytes);
        match ControlCommand::parse(&text) {
            Some(ControlCommand::Stop) => ControlOutcome::Stop,
            Some(ControlCommand::Append(id)) => {
                self.claim(id);
                ControlOutcome::Continue
            }
            None => {
                warn!(
                    target: LISTENER_TARGET,
                    capability = %self.capability,
                    command = %text,
                    "ignoring unknown control command"
                );
                ControlOutcome::Continue
            }
        }
    }

    fn claim(&mut self, id: u64) {
        let parked = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match parked {
            Some(slot) => {
                debug!(
                    target: LISTENER_TARGET,
                    capability = %self.capability,
                    slot = id,
                    plugin = %slot.label,
                    "plugin channel registered"
                );
                self.active.push(ActiveSlot { id, slot });
            }
            None => warn!(
                target: LISTENER_TARGET,
                capability = %self.capability,
                slot = id,
                "append names an unknown slot"
            ),
        }
    }

    fn shutdown(&mut self) {
        let parked: Vec<ChannelSlot> = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        let remaining = self.active.len() + parked.len();
        for slot in self
            .active
            .drain(..)
            .map(|active| active.slot)
            .chain(parked)
        {
            slot.channel.broker.fail_all("plugin listener stopped");
        }
        info!(
            target: LISTENER_TARGET,
            capability = %self.capability,
            remaining,
            "plugin listener stopped"
        );
    }
}

struct Readiness {
    control: bool,
    slots: Vec<bool>,
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|events| {
        events.intersects(
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
        )
    })
}

fn route(slot: &ChannelSlot, bytes: &[u8]) {
    let message = match WireMessage::decode(bytes) {
        Ok(message) => message,
        Err(error) => {
            warn!(
                target: LISTENER_TARGET,
                plugin = %slot.label,
                error = %error,
                "dropping undecodable frame"
            );
            return;
        }
    };
    match message.message_type() {
        MessageType::Function => slot.channel.broker.complete(message),
        MessageType::Callback => info!(
            target: LISTENER_TARGET,
            plugin = %slot.label,
            function = %message.function_name(),
            "callback frames have no upward route; dropped"
        ),
    }
}
