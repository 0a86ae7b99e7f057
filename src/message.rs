//! Hub protocol message types.
//!
//! [`HubMessage`] is the closed set of messages exchanged once the handshake
//! has completed. Both wire formats encode and decode exactly these values.

use std::collections::BTreeMap;

use crate::{binder::ArgumentBindingError, error::HubError, value::Value};

/// Message headers: a string to string map.
pub type Headers = BTreeMap<String, String>;

/// Text of the error raised when a completion carries both outcomes.
pub const RESULT_AND_ERROR: &str =
    "Expected either 'error' or 'result' to be provided, but not both.";

/// Numeric message type carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl MessageType {
    /// Map a wire discriminant to a message type.
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => Self::Invocation,
            2 => Self::StreamItem,
            3 => Self::Completion,
            4 => Self::StreamInvocation,
            5 => Self::CancelInvocation,
            6 => Self::Ping,
            7 => Self::Close,
            _ => return None,
        })
    }

    #[must_use]
    pub fn code(self) -> u8 { self as u8 }
}

/// Invoke `target` with `arguments`; carries an id only when a result is owed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InvocationMessage {
    pub headers: Option<Headers>,
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<Value>,
    pub stream_ids: Option<Vec<String>>,
}

impl InvocationMessage {
    /// A fire-and-forget invocation with no headers or streams.
    #[must_use]
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            arguments,
            ..Self::default()
        }
    }
}

/// Invocation answered by zero or more stream items then one completion.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamInvocationMessage {
    pub headers: Option<Headers>,
    pub invocation_id: String,
    pub target: String,
    pub arguments: Vec<Value>,
    pub stream_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamItemMessage {
    pub headers: Option<Headers>,
    pub invocation_id: String,
    pub item: Value,
}

/// Terminal reply to an invocation.
///
/// A completion carries a result, an error, or neither; never both.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    headers: Option<Headers>,
    invocation_id: String,
    result: Option<Value>,
    error: Option<String>,
}

impl CompletionMessage {
    /// Build a completion, rejecting one that carries both outcomes.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Usage`] when both `result` and `error` are set.
    pub fn new(
        invocation_id: impl Into<String>,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Self, HubError> {
        if result.is_some() && error.is_some() {
            return Err(HubError::Usage(RESULT_AND_ERROR.to_owned()));
        }
        Ok(Self {
            headers: None,
            invocation_id: invocation_id.into(),
            result,
            error,
        })
    }

    /// Completion with neither result nor error.
    #[must_use]
    pub fn void(invocation_id: impl Into<String>) -> Self {
        Self {
            headers: None,
            invocation_id: invocation_id.into(),
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_result(invocation_id: impl Into<String>, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::void(invocation_id)
        }
    }

    #[must_use]
    pub fn with_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::void(invocation_id)
        }
    }

    /// Attach headers to the completion.
    #[must_use]
    pub fn headers(mut self, headers: Option<Headers>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn header_map(&self) -> Option<&Headers> { self.headers.as_ref() }

    #[must_use]
    pub fn invocation_id(&self) -> &str { &self.invocation_id }

    #[must_use]
    pub fn result(&self) -> Option<&Value> { self.result.as_ref() }

    #[must_use]
    pub fn error(&self) -> Option<&str> { self.error.as_deref() }

    /// Split into the owned result and error.
    #[must_use]
    pub fn into_outcome(self) -> (Option<Value>, Option<String>) { (self.result, self.error) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelInvocationMessage {
    pub headers: Option<Headers>,
    pub invocation_id: String,
}

/// Sent by the server before it closes the connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CloseMessage {
    pub error: Option<String>,
    pub allow_reconnect: bool,
}

/// Produced locally when an invocation's arguments fail to bind.
///
/// Never written to the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationBindingFailureMessage {
    pub invocation_id: Option<String>,
    pub target: String,
    pub cause: ArgumentBindingError,
}

/// Every message exchanged after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(InvocationMessage),
    StreamInvocation(StreamInvocationMessage),
    StreamItem(StreamItemMessage),
    Completion(CompletionMessage),
    CancelInvocation(CancelInvocationMessage),
    Ping,
    Close(CloseMessage),
    InvocationBindingFailure(InvocationBindingFailureMessage),
}

impl HubMessage {
    /// Wire type of the message, or `None` for locally synthesised failures.
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        Some(match self {
            HubMessage::Invocation(_) => MessageType::Invocation,
            HubMessage::StreamInvocation(_) => MessageType::StreamInvocation,
            HubMessage::StreamItem(_) => MessageType::StreamItem,
            HubMessage::Completion(_) => MessageType::Completion,
            HubMessage::CancelInvocation(_) => MessageType::CancelInvocation,
            HubMessage::Ping => MessageType::Ping,
            HubMessage::Close(_) => MessageType::Close,
            HubMessage::InvocationBindingFailure(_) => return None,
        })
    }
}
