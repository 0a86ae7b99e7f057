//! Test doubles and fixtures for exercising a
//! [`HubConnection`](hubwire::HubConnection) without a server.
//!
//! [`MockTransport`] stands in for the WebSocket transport: it records every
//! payload the connection sends, answers the handshake, and lets a test inject
//! inbound payloads or close the connection. [`TestHttpClient`] answers
//! negotiate and long-polling requests from a route table.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use hubwire::HubConnectionBuilder;
//! use hubwire_testing::MockTransport;
//!
//! # async fn example() -> hubwire_testing::TestResult {
//! let transport = Arc::new(MockTransport::new());
//! let connection = HubConnectionBuilder::new("http://example.com/hub")
//!     .with_transport_implementation(transport.clone())
//!     .skip_negotiation(true)
//!     .build()?;
//! connection.start().await?;
//! let handshake = transport.next_sent().await;
//! assert_eq!(&handshake[..], b"{\"protocol\":\"json\",\"version\":1}\x1e");
//! # Ok(())
//! # }
//! ```

pub mod http_client;
pub mod logging;
pub mod mock_transport;

pub use http_client::TestHttpClient;
pub use logging::{LoggerHandle, logger};
pub use mock_transport::MockTransport;

/// Result type for fallible tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Text-protocol record separator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Append the record separator to each JSON message and concatenate them.
///
/// ```rust
/// assert_eq!(
///     hubwire_testing::frames(&[r#"{"type":6}"#, "{}"]),
///     "{\"type\":6}\u{1e}{}\u{1e}"
/// );
/// ```
#[must_use]
pub fn frames(messages: &[&str]) -> String {
    messages
        .iter()
        .map(|message| format!("{message}{RECORD_SEPARATOR}"))
        .collect()
}
