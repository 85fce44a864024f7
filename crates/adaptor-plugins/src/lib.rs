//! Plugin transport and lifecycle management for the adaptor daemon.
//!
//! Every capability domain (auth, contact, message, push) is served by one
//! [`Adaptor`]. An adaptor owns a [`PluginRegistry`] and, once started, a
//! listener thread that multiplexes the channels of its forked plugins.
//!
//! Plugins come in two trust tiers behind one call surface:
//!
//! - **in-process** plugins are shared libraries exporting the C ABI in
//!   [`abi`], loaded with `libloading`;
//! - **forked** plugins run inside `adaptor-plugin-host`, which speaks the
//!   framed JSON protocol over its stdin and stdout.
//!
//! # Protocol
//!
//! Each frame is a little-endian `i32` length followed by a JSON
//! [`WireMessage`]. Calls are correlated by a monotonic `request_id` stamped
//! by the [`CallBroker`]; the listener hands every reply to the broker,
//! which wakes exactly the caller waiting on that id. Calls are bounded by a
//! deadline and fail with [`AdaptorError::Timeout`] when it elapses.
//!
//! Context ids are issued by the plugin side from a generation-checked
//! table, so an id always means the same thing on both ends of a channel.

pub mod abi;
pub mod adaptor;
pub mod backend;
pub mod broker;
pub mod collector;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod forked;
pub mod framing;
pub mod listener;
pub mod message;
pub mod operation;
pub mod plugin;
pub mod registry;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests;

pub use self::adaptor::{Adaptor, AdaptorListener, AdaptorSettings};
pub use self::backend::{LibraryBackend, LocalBackend, PluginBackend, TrustTier};
pub use self::broker::CallBroker;
pub use self::collector::{PluginDispatcher, RequestHandler, run_collector};
pub use self::context::{ContextId, ContextTable};
pub use self::descriptor::{PluginContext, PluginHandle, PluginId, PluginSource};
pub use self::error::{AdaptorError, StatusCode};
pub use self::forked::{ForkedBackend, PluginChannel};
pub use self::framing::{
    FramingError, MAX_FRAME, MAX_PAYLOAD, ReadOutcome, read_frame, write_frame,
};
pub use self::message::{FunctionName, MessageType, Param, WireMessage};
pub use self::operation::{CapabilityOperations, Operation};
pub use self::plugin::{CapabilityPlugin, ContextState, Credentials, PluginFailure};
pub use self::registry::{PluginRegistry, ScanSummary};
