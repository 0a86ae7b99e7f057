//! Error types surfaced by [`crate::HubConnection`].
//!
//! Every public async operation fails with [`HubError`]. The error is
//! `Clone` so one terminal cause can be handed to each pending invocation
//! and close callback.

use crate::{http::HttpError, protocol::ProtocolError, value::BindError};

/// Top-level error for hub connection operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum HubError {
    /// The negotiate exchange failed.
    #[error(transparent)]
    Negotiate(#[from] NegotiateError),
    /// The handshake was rejected, malformed or timed out.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// Inbound bytes could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The server completed the invocation with an error.
    #[error("{0}")]
    Invocation(String),
    /// The API was used in a state that does not allow it.
    #[error("{0}")]
    Usage(String),
    /// The connection closed; carries the recorded cause.
    #[error("{0}")]
    ConnectionClosed(String),
    /// The invocation was canceled by a clean stop.
    #[error("Invocation was canceled.")]
    Canceled,
    /// The transport failed to start, send or stop.
    #[error("{0}")]
    Transport(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    /// A result or stream item did not match the declared shape.
    #[error(transparent)]
    Binding(#[from] BindError),
    /// The access token provider failed.
    #[error("access token provider failed: {0}")]
    AccessToken(String),
}

impl HubError {
    pub(crate) fn inactive(method: &str) -> Self {
        HubError::Usage(format!(
            "The '{method}' method cannot be called if the connection is not active."
        ))
    }

    pub(crate) fn closed_while(stage: &str) -> Self {
        HubError::ConnectionClosed(format!("Connection closed while {stage}."))
    }
}

/// Failures of the negotiate exchange. Always fail `start`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum NegotiateError {
    #[error("Unexpected status code returned from negotiate: {status} {reason}.")]
    UnexpectedStatus { status: u16, reason: String },
    /// The server returned an `error` field.
    #[error("{0}")]
    Server(String),
    #[error("Negotiate redirection limit exceeded.")]
    RedirectLimit,
    #[error("There were no compatible transports on the server.")]
    NoCompatibleTransport,
    #[error(
        "Detected an ASP.NET SignalR Server. This client only supports connecting to an ASP.NET \
         Core SignalR Server. See https://aka.ms/signalr-core-differences for details."
    )]
    LegacyServer,
    #[error("Invalid negotiate response: {0}")]
    InvalidResponse(String),
    #[error(
        "Negotiation can only be skipped when using the WebSocket transport directly with \
         '.with_transport(TransportKind::WebSockets)' on the 'HubConnectionBuilder'."
    )]
    SkipRequiresWebSockets,
}

/// Failures of the handshake exchange. Always fail `start`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("An invalid handshake response was received from the server.")]
    InvalidResponse,
    #[error("Error in handshake {0}")]
    Rejected(String),
    #[error("Timed out waiting for the server to respond to the handshake message.")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(HubError::inactive("send"), "The 'send' method cannot be called if the connection is not active.")]
    #[case(HubError::closed_while("trying to connect"), "Connection closed while trying to connect.")]
    #[case(HubError::Canceled, "Invocation was canceled.")]
    #[case(
        NegotiateError::UnexpectedStatus { status: 404, reason: String::new() }.into(),
        "Unexpected status code returned from negotiate: 404 ."
    )]
    #[case(HandshakeError::Rejected("bad".into()).into(), "Error in handshake bad")]
    fn messages_match_protocol_text(#[case] err: HubError, #[case] expected: &str) {
        assert_eq!(err.to_string(), expected);
    }
}
