//! Wire codecs for hub messages.
//!
//! A [`HubProtocol`] converts between [`HubMessage`] values and transport
//! payloads. Two formats are provided:
//!
//! - [`JsonHubProtocol`]: JSON objects, each terminated by the record
//!   separator `0x1E`.
//! - [`MessagePackHubProtocol`]: positional MessagePack arrays, each prefixed
//!   by a variable-length byte count.
//!
//! Codecs hold no state. They consult an [`InvocationBinder`] to type decoded
//! arguments and results.

use std::fmt;

use bytes::Bytes;

use crate::{binder::InvocationBinder, message::HubMessage};

mod error;
pub mod handshake;
mod json;
mod msgpack;

pub use error::ProtocolError;
pub use json::JsonHubProtocol;
pub use msgpack::MessagePackHubProtocol;

/// Byte that terminates every text-format record.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// How a protocol's payloads travel over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    /// UTF-8 text frames.
    Text,
    /// Binary frames.
    Binary,
}

impl TransferFormat {
    /// Name used in negotiate responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransferFormat::Text => "Text",
            TransferFormat::Binary => "Binary",
        }
    }
}

impl fmt::Display for TransferFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Encodes and decodes hub messages for one wire format.
pub trait HubProtocol: Send + Sync + fmt::Debug {
    /// Name announced in the handshake request.
    fn name(&self) -> &str;

    /// Version announced in the handshake request.
    fn version(&self) -> u32;

    fn transfer_format(&self) -> TransferFormat;

    /// Split `payload` into messages, binding values through `binder`.
    ///
    /// Arguments that fail to bind yield an
    /// [`HubMessage::InvocationBindingFailure`] in place of the invocation;
    /// the following messages still decode.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] when the payload framing or a message's
    /// structure is invalid.
    fn parse_messages(
        &self,
        payload: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<Vec<HubMessage>, ProtocolError>;

    /// Encode a single message including its framing.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] for messages that cannot be written,
    /// such as locally synthesised binding failures.
    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError>;
}

#[cfg(test)]
mod tests;
