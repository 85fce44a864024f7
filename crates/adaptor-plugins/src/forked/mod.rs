//! Out-of-process plugin backend.
//!
//! A forked plugin runs inside the `adaptor-plugin-host` executable with its
//! stdin and stdout piped to the adaptor. Requests travel down stdin through
//! the [`CallBroker`]; replies come back on stdout, which is handed to the
//! plugin listener as a [`PluginChannel`]. Stderr is inherited so the child's
//! log events land in the daemon's log sink.

use std::fmt;
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use adaptor_config::Capability;
use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::backend::PluginBackend;
use crate::broker::CallBroker;
use crate::error::AdaptorError;
use crate::listener::FrameSource;
use crate::message::WireMessage;

/// Log target for forked plugin processes.
pub(crate) const FORKED_TARGET: &str = "adaptor_plugins::forked";

/// How long a child may take to exit after its stdin closes.
const EXIT_GRACE: Duration = Duration::from_millis(500);
const EXIT_POLL: Duration = Duration::from_millis(20);

/// Read side of a plugin channel together with the broker awaiting its
/// replies.
pub struct PluginChannel {
    pub(crate) reader: Box<dyn FrameSource>,
    pub(crate) broker: Arc<CallBroker>,
}

impl PluginChannel {
    /// Broker that completes calls with replies read from this channel.
    #[must_use]
    pub fn broker(&self) -> &Arc<CallBroker> {
        &self.broker
    }
}

impl fmt::Debug for PluginChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginChannel")
            .field("broker", &self.broker)
            .finish_non_exhaustive()
    }
}

/// Backend that reaches its plugin through a pipe-connected channel.
pub struct ForkedBackend {
    broker: Arc<CallBroker>,
    child: Mutex<Option<Child>>,
}

impl ForkedBackend {
    /// Starts `host` to run the plugin library at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Create`] if the host cannot be spawned or its
    /// stdio cannot be captured.
    pub fn spawn(
        host: &Utf8Path,
        capability: Capability,
        package_id: &str,
        path: &Utf8Path,
    ) -> Result<(Self, PluginChannel), AdaptorError> {
        debug!(
            target: FORKED_TARGET,
            host = %host,
            capability = %capability,
            package = package_id,
            path = %path,
            "spawning plugin host"
        );
        let mut child = Command::new(host.as_std_path())
            .arg("--capability")
            .arg(capability.to_string())
            .arg("--package")
            .arg(package_id)
            .arg(path.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| {
                AdaptorError::create_io(format!("failed to spawn plugin host '{host}'"), source)
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            terminate_child(package_id, &mut child);
            return Err(AdaptorError::create(format!(
                "plugin host for '{package_id}' has no piped stdio"
            )));
        };

        info!(
            target: FORKED_TARGET,
            package = package_id,
            pid = child.id(),
            "plugin host started"
        );
        let (mut backend, channel) = match Self::from_channels(package_id, stdout, stdin) {
            Ok(wired) => wired,
            Err(error) => {
                terminate_child(package_id, &mut child);
                return Err(error);
            }
        };
        backend.child = Mutex::new(Some(child));
        Ok((backend, channel))
    }

    /// Wires a backend to an existing reader and writer pair.
    ///
    /// Used for plugins whose far end is not a child process of ours.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Create`] if the broker's writer thread cannot
    /// be spawned.
    pub fn from_channels<R, W>(
        label: &str,
        reader: R,
        writer: W,
    ) -> Result<(Self, PluginChannel), AdaptorError>
    where
        R: FrameSource + 'static,
        W: Write + Send + 'static,
    {
        let broker = Arc::new(CallBroker::new(label, Box::new(writer))?);
        let backend = Self {
            broker: Arc::clone(&broker),
            child: Mutex::new(None),
        };
        let channel = PluginChannel {
            reader: Box::new(reader),
            broker,
        };
        Ok((backend, channel))
    }

    /// Broker used for calls.
    #[must_use]
    pub fn broker(&self) -> &Arc<CallBroker> {
        &self.broker
    }
}

impl PluginBackend for ForkedBackend {
    fn call(&self, request: WireMessage, deadline: Duration) -> Result<WireMessage, AdaptorError> {
        self.broker.call(request, deadline)?.into_result()
    }

    fn shutdown(&self) {
        self.broker.fail_all("plugin unloaded");
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            terminate_child(self.broker.label(), &mut child);
        }
    }
}

impl fmt::Debug for ForkedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pid = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Child::id);
        f.debug_struct("ForkedBackend")
            .field("broker", &self.broker)
            .field("pid", &pid)
            .finish()
    }
}

/// Waits for the child to exit after its stdin closed, killing it if the
/// grace period runs out.
fn terminate_child(label: &str, child: &mut Child) {
    let deadline = Instant::now() + EXIT_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(
                    target: FORKED_TARGET,
                    plugin = label,
                    ?status,
                    "plugin host exited"
                );
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
            Ok(None) => break,
            Err(error) => {
                warn!(
                    target: FORKED_TARGET,
                    plugin = label,
                    error = %error,
                    "failed to check plugin host status"
                );
                break;
            }
        }
    }

    warn!(
        target: FORKED_TARGET,
        plugin = label,
        "plugin host did not exit gracefully, killing"
    );
    if let Err(error) = child.kill() {
        debug!(
            target: FORKED_TARGET,
            plugin = label,
            error = %error,
            "kill failed"
        );
    }
    if let Err(error) = child.wait() {
        warn!(
            target: FORKED_TARGET,
            plugin = label,
            error = %error,
            "failed to reap plugin host"
        );
    }
}
