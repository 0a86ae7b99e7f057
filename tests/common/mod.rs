//! Shared utilities for integration tests.
//!
//! Builds connections wired to a [`MockTransport`] with negotiation skipped,
//! so each test drives the server side by injecting payloads.

#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{sync::Arc, time::Duration};

use hubwire::{HubConnection, HubConnectionBuilder};
use hubwire_testing::MockTransport;
use rstest::fixture;

pub use hubwire_testing::{TestResult, frames};

pub const HUB_URL: &str = "http://example.com/hub";

/// A mock transport with the default automatic handshake reply.
#[fixture]
pub fn transport() -> Arc<MockTransport> { Arc::new(MockTransport::new()) }

/// Builder wired to `transport` that skips negotiation.
pub fn builder(transport: &Arc<MockTransport>) -> HubConnectionBuilder {
    HubConnectionBuilder::new(HUB_URL)
        .with_transport_implementation(transport.clone())
        .skip_negotiation(true)
}

/// Build, start, and consume the handshake request.
#[expect(
    clippy::expect_used,
    reason = "a connection that cannot start must abort the test immediately"
)]
pub async fn connected(transport: &Arc<MockTransport>) -> HubConnection {
    let connection = builder(transport).build().expect("valid builder");
    connection.start().await.expect("start succeeds");
    transport.next_sent().await;
    connection
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
