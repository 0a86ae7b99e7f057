//! Error types for the hub protocol codecs.
//!
//! A [`ProtocolError`] means the payload could not be split into messages or
//! a message lacked its required structure. It is fatal to the connection
//! that received it. Argument binding problems are not protocol errors; the
//! codecs report those as `InvocationBindingFailure` messages instead.

use thiserror::Error;

use crate::message::RESULT_AND_ERROR;

/// Framing or structural violation in an inbound or outbound payload.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Text payload did not end with a record separator.
    #[error("Message is incomplete.")]
    IncompleteMessage,

    /// Binary length prefix is malformed or truncated.
    #[error("Invalid length prefix in MessagePack payload.")]
    InvalidLengthPrefix,

    /// Binary length prefix claims more bytes than remain in the payload.
    #[error("MessagePack message was length {actual} but claimed to be length {claimed}.")]
    LengthMismatch {
        /// Bytes actually available after the prefix.
        actual: usize,
        /// Bytes announced by the prefix.
        claimed: usize,
    },

    /// Message body is not valid for its format.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A required field is absent.
    #[error("Missing required property '{0}'.")]
    MissingField(&'static str),

    /// A field is present with the wrong type.
    #[error("Property '{field}' has an invalid type; expected {expected}.")]
    InvalidField {
        /// Field name (or position for the binary format).
        field: &'static str,
        /// Expected wire type.
        expected: &'static str,
    },

    /// Completion carried both `result` and `error`.
    #[error("{}", RESULT_AND_ERROR)]
    ResultAndError,

    /// Message could not be serialised.
    #[error("Failed to encode message: {0}")]
    Encode(String),
}
