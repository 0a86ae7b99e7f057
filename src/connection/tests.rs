use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::{error::HubError, value::Shape};

#[fixture]
fn connection() -> HubConnection {
    HubConnectionBuilder::new("http://example.com/hub")
        .build()
        .expect("valid builder")
}

#[test]
fn empty_url_is_rejected() {
    let err = HubConnectionBuilder::new("").build().expect_err("empty url");
    assert_eq!(err, HubError::Usage("A valid url is required.".into()));
}

#[rstest]
fn new_connection_is_disconnected(connection: HubConnection) {
    assert_eq!(connection.connection_state(), HubConnectionState::Disconnected);
    assert_eq!(connection.connection_id(), None);
    assert_eq!(connection.base_url(), "http://example.com/hub");
}

#[rstest]
fn defaults_apply(connection: HubConnection) {
    assert_eq!(connection.server_timeout(), Duration::from_secs(30));
    assert_eq!(connection.keep_alive_interval(), Duration::from_secs(15));
    assert_eq!(connection.handshake_response_timeout(), Duration::from_secs(15));
}

#[test]
fn builder_overrides_timeouts() {
    let connection = HubConnectionBuilder::new("http://example.com/hub")
        .server_timeout(Duration::from_secs(60))
        .keep_alive_interval(Duration::from_secs(5))
        .handshake_response_timeout(Duration::from_millis(250))
        .build()
        .expect("valid builder");
    assert_eq!(connection.server_timeout(), Duration::from_secs(60));
    assert_eq!(connection.keep_alive_interval(), Duration::from_secs(5));
    assert_eq!(connection.handshake_response_timeout(), Duration::from_millis(250));
}

#[rstest]
fn base_url_changes_while_disconnected(connection: HubConnection) {
    connection
        .set_base_url("http://example.com/other")
        .expect("disconnected");
    assert_eq!(connection.base_url(), "http://example.com/other");
}

#[rstest]
fn empty_base_url_is_rejected(connection: HubConnection) {
    let err = connection.set_base_url("").expect_err("empty url");
    assert_eq!(
        err,
        HubError::Usage("The HubConnection url must be a valid url.".into())
    );
    assert_eq!(connection.base_url(), "http://example.com/hub");
}

#[rstest]
fn base_url_is_fixed_while_connecting(connection: HubConnection) {
    connection.inner.lock().state = HubConnectionState::Connecting;
    let err = connection
        .set_base_url("http://example.com/other")
        .expect_err("not disconnected");
    assert!(matches!(err, HubError::Usage(ref msg) if msg.contains("disconnected state")));
}

#[rstest]
#[tokio::test]
async fn send_requires_connection(connection: HubConnection) {
    let err = connection
        .send("echo", vec!["hi".into()])
        .await
        .expect_err("inactive");
    assert_eq!(err, HubError::inactive("send"));
}

#[rstest]
#[tokio::test]
async fn invoke_requires_connection(connection: HubConnection) {
    let err = connection.invoke("echo", vec![]).await.expect_err("inactive");
    assert_eq!(err, HubError::inactive("invoke"));
}

#[rstest]
#[tokio::test]
async fn stream_requires_connection(connection: HubConnection) {
    let err = connection
        .stream("counter", vec![3.into()], Shape::Int)
        .await
        .expect_err("inactive");
    assert_eq!(err, HubError::inactive("stream"));
}

#[rstest]
#[tokio::test]
async fn stop_when_disconnected_is_a_no_op(connection: HubConnection) {
    let closed = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&closed);
    connection.on_closed(move |_| {
        seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    connection.stop().await.expect("no-op stop");
    assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(connection.connection_state(), HubConnectionState::Disconnected);
}

#[rstest]
fn second_result_handler_is_rejected(connection: HubConnection) {
    let _first = connection
        .on_with_result("add", vec![Shape::Int, Shape::Int], |_| async { Ok(Value::Nil) })
        .expect("first result handler");
    let err = connection
        .on_with_result("add", vec![Shape::Int, Shape::Int], |_| async { Ok(Value::Nil) })
        .expect_err("duplicate result handler");
    assert!(matches!(err, HubError::Usage(_)));
}
