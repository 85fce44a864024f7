//! Wire message exchanged between the adaptor and its plugins.
//!
//! A [`WireMessage`] is serialised as one JSON object and carried inside a
//! single frame (see [`crate::framing`]). JSON escapes control characters, so
//! the encoded form never contains a NUL byte and can cross the in-process
//! ABI as a C string unchanged.
//!
//! Positional parameters are 1-indexed: `param(1)` is the first value and
//! `param(0)` is always `None`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::ContextId;
use crate::error::{AdaptorError, StatusCode};
use crate::operation::Operation;

/// Direction of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A call or its reply.
    Function,
    /// An unsolicited event raised by a plugin.
    Callback,
}

/// Positional parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    /// Integer value.
    Num(i64),
    /// Text value.
    Str(String),
}

impl Param {
    /// Text value, if this is a string parameter.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value.as_str()),
            Self::Num(_) => None,
        }
    }

    /// Integer value, if this is a numeric parameter.
    #[must_use]
    pub const fn as_num(&self) -> Option<i64> {
        match self {
            Self::Num(value) => Some(*value),
            Self::Str(_) => None,
        }
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Self::Num(value)
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Num(i64::from(value))
    }
}

/// Name of the remote function a message targets.
///
/// Names outside the closed [`Operation`] set still decode, so the receiver
/// can answer `unsupported` while echoing the request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunctionName {
    /// A known operation.
    Known(Operation),
    /// Any other name.
    Unknown(String),
}

impl FunctionName {
    /// Known operation, if any.
    #[must_use]
    pub const fn operation(&self) -> Option<Operation> {
        match self {
            Self::Known(operation) => Some(*operation),
            Self::Unknown(_) => None,
        }
    }

    /// Wire spelling of the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Known(operation) => operation.as_str(),
            Self::Unknown(name) => name.as_str(),
        }
    }
}

impl From<Operation> for FunctionName {
    fn from(operation: Operation) -> Self {
        Self::Known(operation)
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request, reply or callback on the plugin transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    message_type: MessageType,
    #[serde(default)]
    context_id: ContextId,
    #[serde(default)]
    request_id: u64,
    function_name: FunctionName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plugin_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    params: Vec<Param>,
}

impl WireMessage {
    /// Creates a function call targeting `context`.
    #[must_use]
    pub fn call(function: impl Into<FunctionName>, context: ContextId) -> Self {
        Self::new(MessageType::Function, function.into(), context)
    }

    /// Creates a plugin-originated callback.
    #[must_use]
    pub fn callback(function: impl Into<FunctionName>, context: ContextId) -> Self {
        Self::new(MessageType::Callback, function.into(), context)
    }

    const fn new(
        message_type: MessageType,
        function_name: FunctionName,
        context: ContextId,
    ) -> Self {
        Self {
            message_type,
            context_id: context,
            request_id: 0,
            function_name,
            result_code: None,
            result_message: None,
            plugin_code: None,
            params: Vec::new(),
        }
    }

    /// Creates a successful reply that identifies `request`.
    ///
    /// The context id, request id and function name are copied through so
    /// the reply can be routed back to its caller.
    #[must_use]
    pub fn reply_to(request: &Self) -> Self {
        Self {
            message_type: MessageType::Function,
            context_id: request.context_id,
            request_id: request.request_id,
            function_name: request.function_name.clone(),
            result_code: Some(StatusCode::None.code()),
            result_message: None,
            plugin_code: None,
            params: Vec::new(),
        }
    }

    /// Appends one positional parameter.
    #[must_use]
    pub fn with_param(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Appends positional parameters in order.
    #[must_use]
    pub fn with_params(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        self.params.extend(params);
        self
    }

    /// Marks this reply as failed with `error`.
    #[must_use]
    pub fn with_error(mut self, error: &AdaptorError) -> Self {
        self.result_code = Some(error.status().code());
        self.result_message = Some(error.to_string());
        self.plugin_code = match error {
            AdaptorError::PluginInternal { code, .. } => Some(*code),
            _ => None,
        };
        self.params.clear();
        self
    }

    /// Direction of the message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Context the message targets.
    #[must_use]
    pub const fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Correlation id stamped by the call broker.
    #[must_use]
    pub const fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Stamps the correlation id.
    pub const fn set_request_id(&mut self, request_id: u64) {
        self.request_id = request_id;
    }

    /// Remote function name.
    #[must_use]
    pub const fn function_name(&self) -> &FunctionName {
        &self.function_name
    }

    /// Known operation, if the function name is one.
    #[must_use]
    pub const fn operation(&self) -> Option<Operation> {
        self.function_name.operation()
    }

    /// Integer status of a reply.
    #[must_use]
    pub const fn result_code(&self) -> Option<i32> {
        self.result_code
    }

    /// Nested plugin error code of a `plugin_internal` reply.
    #[must_use]
    pub const fn plugin_code(&self) -> Option<i32> {
        self.plugin_code
    }

    /// All positional parameters.
    #[must_use]
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Parameter at 1-based `index`.
    #[must_use]
    pub fn param(&self, index: usize) -> Option<&Param> {
        self.params.get(index.checked_sub(1)?)
    }

    /// Text parameter at 1-based `index`.
    #[must_use]
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.param(index)?.as_str()
    }

    /// Numeric parameter at 1-based `index`.
    #[must_use]
    pub fn param_num(&self, index: usize) -> Option<i64> {
        self.param(index)?.as_num()
    }

    /// Converts a reply into `Ok(self)` or the error its status describes.
    ///
    /// A missing `result_code` is treated as success.
    ///
    /// # Errors
    ///
    /// Returns the [`AdaptorError`] rebuilt from a non-zero status.
    pub fn into_result(self) -> Result<Self, AdaptorError> {
        let Some(code) = self.result_code else {
            return Ok(self);
        };
        match AdaptorError::from_status(
            code,
            self.result_message.as_deref(),
            self.plugin_code,
            self.function_name.as_str(),
        ) {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }

    /// Serialises the message to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Codec`] if serialisation fails.
    pub fn encode(&self) -> Result<Vec<u8>, AdaptorError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Serialises the message to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Codec`] if serialisation fails.
    pub fn encode_string(&self) -> Result<String, AdaptorError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a message from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Codec`] for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, AdaptorError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Recovers the request id of a frame that failed to decode as a message.
pub(crate) fn salvage_request_id(bytes: &[u8]) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value.get("request_id")?.as_u64()
}
