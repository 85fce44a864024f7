//! Domain errors and wire status codes for adaptor operations.
//!
//! Every failure surfaced to a caller is an [`AdaptorError`]; every error maps
//! to exactly one [`StatusCode`], which is the integer carried in
//! `result_code` on the pipe transport and handed to the upward RPC layer.
//! I/O errors are wrapped in `Arc` to satisfy the `result_large_err` Clippy
//! lint and to keep the error cheap to clone across threads.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use adaptor_config::Capability;
use strum::{Display, IntoStaticStr};
use thiserror::Error;

use crate::framing::FramingError;

/// Status code carried on the wire and reported to upward callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum StatusCode {
    /// The call succeeded.
    None,
    /// An argument was missing or malformed.
    InvalidArgument,
    /// A plugin handle or vtable was unusable.
    InvalidHandle,
    /// A registry lookup missed.
    NotFound,
    /// The plugin does not implement the requested operation.
    Unsupported,
    /// The plugin reported an error from its own logic.
    PluginInternal,
    /// The transport to a forked plugin failed.
    Channel,
    /// A forked plugin did not reply before the call deadline.
    Timeout,
    /// A plugin or context could not be created.
    Create,
    /// A plugin or context could not be destroyed.
    Destroy,
    /// The adaptor has not been started.
    NotStarted,
    /// The adaptor is already running.
    AlreadyStarted,
}

impl StatusCode {
    /// Integer value used in `result_code`.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::None => 0,
            Self::InvalidArgument => 1,
            Self::InvalidHandle => 2,
            Self::NotFound => 3,
            Self::Unsupported => 4,
            Self::PluginInternal => 5,
            Self::Channel => 6,
            Self::Timeout => 7,
            Self::Create => 8,
            Self::Destroy => 9,
            Self::NotStarted => 10,
            Self::AlreadyStarted => 11,
        }
    }

    /// Resolves a status from its integer value.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::InvalidArgument),
            2 => Some(Self::InvalidHandle),
            3 => Some(Self::NotFound),
            4 => Some(Self::Unsupported),
            5 => Some(Self::PluginInternal),
            6 => Some(Self::Channel),
            7 => Some(Self::Timeout),
            8 => Some(Self::Create),
            9 => Some(Self::Destroy),
            10 => Some(Self::NotStarted),
            11 => Some(Self::AlreadyStarted),
            _ => None,
        }
    }

    /// Returns `true` for [`StatusCode::None`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::None)
    }
}

/// Errors arising from adaptor, registry and transport operations.
#[derive(Debug, Clone, Error)]
pub enum AdaptorError {
    /// An argument was missing or malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected argument.
        message: String,
    },

    /// A plugin handle or vtable was unusable.
    #[error("invalid plugin handle: {message}")]
    InvalidHandle {
        /// Description of the defect.
        message: String,
    },

    /// A registry lookup missed.
    #[error("'{name}' not found")]
    NotFound {
        /// Name, URI or path that was looked up.
        name: String,
    },

    /// The plugin does not implement the requested operation.
    #[error("operation '{operation}' is not supported")]
    Unsupported {
        /// Wire name of the operation.
        operation: String,
    },

    /// The plugin reported an error from its own logic.
    #[error("plugin error {code}: {message}")]
    PluginInternal {
        /// Plugin-defined error code.
        code: i32,
        /// Plugin-supplied description.
        message: String,
    },

    /// The transport to a forked plugin failed.
    #[error("plugin channel failure: {message}")]
    Channel {
        /// Description of the failure.
        message: String,
        /// Underlying I/O error, when one exists.
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// A forked plugin did not reply before the call deadline.
    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Wire name of the operation.
        operation: String,
        /// Deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// A plugin or context could not be created.
    #[error("create failed: {message}")]
    Create {
        /// Description of the failure.
        message: String,
        /// Underlying I/O error, when one exists.
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// A plugin or context could not be destroyed.
    #[error("destroy failed: {message}")]
    Destroy {
        /// Description of the failure.
        message: String,
    },

    /// The adaptor has not been started.
    #[error("{capability} adaptor is not started")]
    NotStarted {
        /// Capability served by the adaptor.
        capability: Capability,
    },

    /// The adaptor is already running.
    #[error("{capability} adaptor is already started")]
    AlreadyStarted {
        /// Capability served by the adaptor.
        capability: Capability,
    },

    /// A wire message could not be encoded or decoded.
    #[error("wire message codec error: {source}")]
    Codec {
        /// Underlying JSON error.
        #[source]
        source: Arc<serde_json::Error>,
    },
}

impl AdaptorError {
    /// Builds an [`AdaptorError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Builds an [`AdaptorError::Channel`] without an I/O source.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
            source: None,
        }
    }

    /// Builds an [`AdaptorError::Channel`] wrapping an I/O error.
    pub fn channel_io(message: impl Into<String>, source: io::Error) -> Self {
        Self::Channel {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Builds an [`AdaptorError::Create`] without an I/O source.
    pub fn create(message: impl Into<String>) -> Self {
        Self::Create {
            message: message.into(),
            source: None,
        }
    }

    /// Builds an [`AdaptorError::Create`] wrapping an I/O error.
    pub fn create_io(message: impl Into<String>, source: io::Error) -> Self {
        Self::Create {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Builds an [`AdaptorError::Timeout`] from the elapsed deadline.
    pub fn timeout(operation: impl Into<String>, deadline: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Status code reported for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument { .. } | Self::Codec { .. } => StatusCode::InvalidArgument,
            Self::InvalidHandle { .. } => StatusCode::InvalidHandle,
            Self::NotFound { .. } => StatusCode::NotFound,
            Self::Unsupported { .. } => StatusCode::Unsupported,
            Self::PluginInternal { .. } => StatusCode::PluginInternal,
            Self::Channel { .. } => StatusCode::Channel,
            Self::Timeout { .. } => StatusCode::Timeout,
            Self::Create { .. } => StatusCode::Create,
            Self::Destroy { .. } => StatusCode::Destroy,
            Self::NotStarted { .. } => StatusCode::NotStarted,
            Self::AlreadyStarted { .. } => StatusCode::AlreadyStarted,
        }
    }

    /// Rebuilds an error from the status fields of a reply.
    ///
    /// Returns `None` when `code` is [`StatusCode::None`]. Codes that only
    /// the host side can produce (transport, timeout and adaptor state) are
    /// reported as [`AdaptorError::PluginInternal`] because a plugin has no
    /// business returning them.
    #[must_use]
    pub fn from_status(
        code: i32,
        message: Option<&str>,
        plugin_code: Option<i32>,
        operation: &str,
    ) -> Option<Self> {
        let text = message.unwrap_or_default().to_owned();
        let error = match StatusCode::from_code(code) {
            Some(StatusCode::None) => return None,
            Some(StatusCode::InvalidArgument) => Self::InvalidArgument { message: text },
            Some(StatusCode::InvalidHandle) => Self::InvalidHandle { message: text },
            Some(StatusCode::NotFound) => Self::NotFound { name: text },
            Some(StatusCode::Unsupported) => Self::Unsupported {
                operation: operation.to_owned(),
            },
            Some(StatusCode::PluginInternal) => Self::PluginInternal {
                code: plugin_code.unwrap_or(code),
                message: text,
            },
            Some(StatusCode::Create) => Self::Create {
                message: text,
                source: None,
            },
            Some(StatusCode::Destroy) => Self::Destroy { message: text },
            Some(
                StatusCode::Channel
                | StatusCode::Timeout
                | StatusCode::NotStarted
                | StatusCode::AlreadyStarted,
            )
            | None => Self::PluginInternal {
                code: plugin_code.unwrap_or(code),
                message: text,
            },
        };
        Some(error)
    }
}

impl From<FramingError> for AdaptorError {
    fn from(error: FramingError) -> Self {
        match error {
            FramingError::Io(source) => Self::Channel {
                message: String::from("pipe I/O failed"),
                source: Some(source),
            },
            other @ (FramingError::Oversized { .. } | FramingError::Truncated { .. }) => {
                Self::channel(other.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for AdaptorError {
    fn from(source: serde_json::Error) -> Self {
        Self::Codec {
            source: Arc::new(source),
        }
    }
}
