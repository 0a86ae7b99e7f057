//! Handshake framing.
//!
//! The handshake always uses JSON records terminated by the record
//! separator, whichever hub protocol it announces.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::RECORD_SEPARATOR;
use crate::error::HandshakeError;

/// First message sent on a new transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandshakeRequest<'a> {
    pub protocol: &'a str,
    pub version: u32,
}

impl HandshakeRequest<'_> {
    /// Encode as a record-separated JSON object.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        // A struct of a string and an integer always serialises.
        let mut buf = serde_json::to_vec(self).unwrap_or_default();
        buf.push(RECORD_SEPARATOR);
        Bytes::from(buf)
    }
}

/// The server's reply to a [`HandshakeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "type")]
    message_type: Option<i64>,
}

impl HandshakeResponse {
    /// Build a response carrying an optional server error.
    #[must_use]
    pub fn new(error: Option<String>) -> Self {
        Self {
            error,
            message_type: None,
        }
    }

    /// Fail if the server rejected the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Rejected`] for a non-empty `error` field.
    pub fn into_result(self) -> Result<(), HandshakeError> {
        match self.error {
            Some(error) if !error.is_empty() => Err(HandshakeError::Rejected(error)),
            _ => Ok(()),
        }
    }
}

/// Strip the handshake record from the front of `payload`.
///
/// Returns the parsed response and the bytes that follow it, which belong to
/// the regular message stream.
///
/// # Errors
///
/// Returns [`HandshakeError::InvalidResponse`] when no complete record is
/// present or the record is not a handshake response.
pub fn parse_response(payload: &[u8]) -> Result<(HandshakeResponse, &[u8]), HandshakeError> {
    let end = payload
        .iter()
        .position(|b| *b == RECORD_SEPARATOR)
        .ok_or(HandshakeError::InvalidResponse)?;
    let response: HandshakeResponse =
        serde_json::from_slice(&payload[..end]).map_err(|_| HandshakeError::InvalidResponse)?;
    if response.message_type.is_some() {
        return Err(HandshakeError::InvalidResponse);
    }
    Ok((response, &payload[end + 1..]))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn request_is_record_separated_json() {
        let bytes = HandshakeRequest {
            protocol: "json",
            version: 1,
        }
        .to_bytes();
        assert_eq!(&bytes[..], b"{\"protocol\":\"json\",\"version\":1}\x1e");
    }

    #[test]
    fn response_prefix_is_stripped() {
        let payload = b"{}\x1e{\"type\":6}\x1e";
        let (response, rest) = parse_response(payload).expect("valid handshake");
        assert_eq!(response.into_result(), Ok(()));
        assert_eq!(rest, b"{\"type\":6}\x1e");
    }

    #[test]
    fn server_error_rejects_handshake() {
        let (response, _) =
            parse_response(b"{\"error\":\"Requested protocol 'x' is not available.\"}\x1e")
                .expect("well formed");
        assert_eq!(
            response.into_result(),
            Err(HandshakeError::Rejected(
                "Requested protocol 'x' is not available.".into()
            ))
        );
    }

    #[rstest]
    #[case::no_separator(&b"{}"[..])]
    #[case::not_json(&b"not json\x1e"[..])]
    #[case::hub_message(&b"{\"type\":6}\x1e"[..])]
    fn invalid_responses_are_rejected(#[case] payload: &[u8]) {
        assert_eq!(
            parse_response(payload).map(|(r, _)| r),
            Err(HandshakeError::InvalidResponse)
        );
    }
}
