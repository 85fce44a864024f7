//! Plugin-side request handling.
//!
//! [`PluginDispatcher`] resolves contexts and turns requests into
//! [`CapabilityPlugin`] calls. [`run_collector`] is the main loop of a forked
//! plugin process: it reads one framed request at a time from the parent,
//! dispatches it, and writes the reply back on the same channel.

use std::io::{Read, Write};

use adaptor_config::Capability;
use tracing::{debug, info, warn};

use crate::context::{ContextId, ContextTable};
use crate::error::AdaptorError;
use crate::framing::{FramingError, MAX_PAYLOAD, ReadOutcome, read_frame, write_frame};
use crate::message::{FunctionName, MessageType, Param, WireMessage, salvage_request_id};
use crate::operation::{CapabilityOperations, Operation};
use crate::plugin::{CapabilityPlugin, ContextState, Credentials};

/// Log target for collector operations.
pub(crate) const COLLECTOR_TARGET: &str = "adaptor_plugins::collector";

/// Something that answers wire requests with wire replies.
///
/// Implemented by [`PluginDispatcher`] for plugins linked into the running
/// process, and by [`crate::LibraryBackend`] for plugins behind the
/// in-process ABI.
pub trait RequestHandler {
    /// Produces the reply for `request`. Failures are encoded in the reply.
    fn handle(&mut self, request: &WireMessage) -> WireMessage;
}

/// Dispatches wire requests to one plugin and owns its contexts.
pub struct PluginDispatcher {
    plugin: Box<dyn CapabilityPlugin>,
    contexts: ContextTable<ContextState>,
    uri: String,
    capability: Capability,
    operations: Vec<Operation>,
}

impl PluginDispatcher {
    /// Wraps a plugin after checking it provides its mandatory operations.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Create`] when a mandatory operation is missing
    /// or an operation falls outside the plugin's capability.
    pub fn new(plugin: Box<dyn CapabilityPlugin>) -> Result<Self, AdaptorError> {
        let capability = plugin.capability();
        let uri = plugin.uri().to_owned();
        let operations = plugin.operations().to_vec();
        if let Some(missing) = capability
            .mandatory_operations()
            .iter()
            .find(|operation| !operations.contains(operation))
        {
            return Err(AdaptorError::create(format!(
                "plugin '{uri}' does not implement mandatory operation '{missing}'"
            )));
        }
        if let Some(foreign) = operations
            .iter()
            .find(|operation| !capability.supports(**operation))
        {
            return Err(AdaptorError::create(format!(
                "plugin '{uri}' declares '{foreign}', which is not a {capability} operation"
            )));
        }
        Ok(Self {
            plugin,
            contexts: ContextTable::new(),
            uri,
            capability,
            operations,
        })
    }

    /// Plugin URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        self.uri.as_str()
    }

    /// Capability served by the plugin.
    #[must_use]
    pub const fn capability(&self) -> Capability {
        self.capability
    }

    /// Number of open contexts.
    #[must_use]
    pub const fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn dispatch(&mut self, request: &WireMessage) -> Result<Vec<Param>, AdaptorError> {
        if request.message_type() != MessageType::Function {
            return Err(AdaptorError::invalid_argument(
                "plugins only accept function messages",
            ));
        }
        let Some(operation) = request.operation() else {
            return Err(AdaptorError::Unsupported {
                operation: request.function_name().as_str().to_owned(),
            });
        };
        if !self.operations.contains(&operation) {
            return Err(AdaptorError::Unsupported {
                operation: operation.as_str().to_owned(),
            });
        }

        match operation {
            Operation::CreateContext => self.create_context(request.params()),
            Operation::DestroyContext => self.destroy_context(request.context_id()),
            other => {
                let state = self
                    .contexts
                    .get_mut(request.context_id())
                    .ok_or_else(|| unknown_context(request.context_id()))?;
                self.plugin
                    .invoke(other, state, request.params())
                    .map_err(|failure| failure.into_error(other))
            }
        }
    }

    fn create_context(&mut self, params: &[Param]) -> Result<Vec<Param>, AdaptorError> {
        let credentials = Credentials::from_params(params)
            .map_err(|failure| failure.into_error(Operation::CreateContext))?;
        let state = self
            .plugin
            .create_context(credentials)
            .map_err(|failure| failure.into_error(Operation::CreateContext))?;
        let id = self
            .contexts
            .insert(state)
            .ok_or_else(|| AdaptorError::create("context table is full"))?;
        debug!(
            target: COLLECTOR_TARGET,
            plugin = %self.uri,
            context = %id,
            "context created"
        );
        Ok(vec![Param::Num(id.as_param())])
    }

    fn destroy_context(&mut self, id: ContextId) -> Result<Vec<Param>, AdaptorError> {
        let state = self.contexts.remove(id).ok_or_else(|| unknown_context(id))?;
        self.plugin
            .destroy_context(state)
            .map_err(|failure| failure.into_error(Operation::DestroyContext))?;
        debug!(
            target: COLLECTOR_TARGET,
            plugin = %self.uri,
            context = %id,
            "context destroyed"
        );
        Ok(Vec::new())
    }
}

impl RequestHandler for PluginDispatcher {
    fn handle(&mut self, request: &WireMessage) -> WireMessage {
        let reply = WireMessage::reply_to(request);
        match self.dispatch(request) {
            Ok(params) => reply.with_params(params),
            Err(error) => {
                debug!(
                    target: COLLECTOR_TARGET,
                    plugin = %self.uri,
                    function = %request.function_name(),
                    error = %error,
                    "request failed"
                );
                reply.with_error(&error)
            }
        }
    }
}

impl Drop for PluginDispatcher {
    fn drop(&mut self) {
        for (id, state) in self.contexts.drain() {
            if let Err(failure) = self.plugin.destroy_context(state) {
                warn!(
                    target: COLLECTOR_TARGET,
                    plugin = %self.uri,
                    context = %id,
                    error = %failure,
                    "failed to destroy context during shutdown"
                );
            }
        }
    }
}

impl std::fmt::Debug for PluginDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDispatcher")
            .field("uri", &self.uri)
            .field("capability", &self.capability)
            .field("contexts", &self.contexts.len())
            .finish_non_exhaustive()
    }
}

fn unknown_context(id: ContextId) -> AdaptorError {
    AdaptorError::invalid_argument(format!("unknown context {id}"))
}

/// Serves requests from `reader` until the peer disconnects.
///
/// Returns the number of requests answered.
///
/// # Errors
///
/// Returns a [`FramingError`] when the channel fails or carries a corrupt
/// frame; the caller should terminate.
pub fn run_collector<R, W, H>(
    reader: &mut R,
    writer: &mut W,
    handler: &mut H,
) -> Result<u64, FramingError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    H: RequestHandler + ?Sized,
{
    let mut answered = 0_u64;
    loop {
        let bytes = match read_frame(reader)? {
            ReadOutcome::Frame(bytes) => bytes,
            ReadOutcome::EndOfStream => {
                info!(
                    target: COLLECTOR_TARGET,
                    answered,
                    "parent disconnected"
                );
                return Ok(answered);
            }
        };

        let reply = match WireMessage::decode(&bytes) {
            Ok(request) => handler.handle(&request),
            Err(error) => {
                let Some(request_id) = salvage_request_id(&bytes) else {
                    warn!(
                        target: COLLECTOR_TARGET,
                        error = %error,
                        "dropping undecodable request without a request id"
                    );
                    continue;
                };
                let mut request =
                    WireMessage::call(FunctionName::Unknown(String::new()), ContextId::NONE);
                request.set_request_id(request_id);
                WireMessage::reply_to(&request).with_error(&error)
            }
        };

        let Some(payload) = encode_reply(&reply) else {
            continue;
        };
        write_frame(writer, &payload)?;
        answered += 1;
    }
}

/// Encodes a reply, replacing it with an error reply when it cannot fit a
/// frame.
fn encode_reply(reply: &WireMessage) -> Option<Vec<u8>> {
    let encoded = reply.encode().and_then(|payload| {
        if payload.len() > MAX_PAYLOAD {
            Err(AdaptorError::PluginInternal {
                code: 0,
                message: format!("reply of {} bytes exceeds the frame limit", payload.len()),
            })
        } else {
            Ok(payload)
        }
    });
    match encoded {
        Ok(payload) => Some(payload),
        Err(error) => {
            warn!(
                target: COLLECTOR_TARGET,
                request_id = reply.request_id(),
                error = %error,
                "replacing unencodable reply"
            );
            let fallback = WireMessage::reply_to(reply).with_error(&error);
            fallback.encode().ok()
        }
    }
}
