//! Integration tests for server timeouts and keep-alive pings.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use hubwire::{HubConnectionState, HubError};
use hubwire_testing::MockTransport;

mod common;
use common::{TestResult, builder, eventually, frames};

#[tokio::test]
async fn silent_server_times_out() -> TestResult {
    let transport = Arc::new(MockTransport::new());
    let connection = builder(&transport)
        .server_timeout(Duration::from_millis(50))
        .tick_rate(Duration::from_millis(5))
        .build()?;
    let reported = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&reported);
    connection.on_closed(move |error| *slot.lock().expect("slot lock") = error.cloned());

    connection.start().await?;

    assert!(
        eventually(|| connection.connection_state() == HubConnectionState::Disconnected).await
    );
    assert_eq!(
        *reported.lock().expect("slot lock"),
        Some(HubError::ConnectionClosed(
            "Server timeout elapsed without receiving a message from the server.".into()
        ))
    );
    Ok(())
}

#[tokio::test]
async fn inbound_traffic_keeps_the_connection_alive() -> TestResult {
    let transport = Arc::new(MockTransport::new());
    let connection = builder(&transport)
        .server_timeout(Duration::from_millis(150))
        .tick_rate(Duration::from_millis(5))
        .build()?;
    connection.start().await?;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        transport.receive_message(&frames(&[r#"{"type":6}"#]));
    }

    assert_eq!(connection.connection_state(), HubConnectionState::Connected);
    connection.stop().await?;
    Ok(())
}

#[tokio::test]
async fn idle_client_sends_pings() -> TestResult {
    let transport = Arc::new(MockTransport::new().with_pings());
    let connection = builder(&transport)
        .keep_alive_interval(Duration::from_millis(20))
        .tick_rate(Duration::from_millis(5))
        .build()?;
    connection.start().await?;
    transport.next_sent().await;

    assert_eq!(transport.next_sent_message().await, frames(&[r#"{"type":6}"#]));
    Ok(())
}

#[tokio::test]
async fn pings_are_not_sent_before_the_interval() -> TestResult {
    let transport = Arc::new(MockTransport::new().with_pings());
    let connection = builder(&transport)
        .keep_alive_interval(Duration::from_secs(60))
        .tick_rate(Duration::from_millis(5))
        .build()?;
    connection.start().await?;
    transport.next_sent().await;

    assert_eq!(transport.next_sent_within(Duration::from_millis(100)).await, None);
    connection.stop().await?;
    Ok(())
}
