//! Integration tests for client-to-server invocations.

use std::sync::Arc;

use hubwire::{HubConnectionState, HubError, Shape, UploadSource, Value};
use hubwire_testing::MockTransport;
use rstest::rstest;

mod common;
use common::{TestResult, connected, eventually, frames, transport};

#[rstest]
#[tokio::test]
async fn send_writes_invocation_without_id(transport: Arc<MockTransport>) -> TestResult {
    let connection = connected(&transport).await;

    connection.send("inc", vec![1.into(), "two".into()]).await?;

    assert_eq!(
        transport.next_sent_message().await,
        frames(&[r#"{"type":1,"target":"inc","arguments":[1,"two"]}"#])
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn invoke_resolves_with_bound_result(transport: Arc<MockTransport>) -> TestResult {
    let connection = connected(&transport).await;
    let pending = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke_value("echo", vec!["hi".into()], Shape::String).await }
    });

    assert_eq!(
        transport.next_sent_message().await,
        frames(&[r#"{"type":1,"invocationId":"1","target":"echo","arguments":["hi"]}"#])
    );
    transport.receive_message(&frames(&[r#"{"type":3,"invocationId":"1","result":"hi"}"#]));

    assert_eq!(pending.await??, Value::from("hi"));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn void_completion_yields_nil(transport: Arc<MockTransport>) -> TestResult {
    let connection = connected(&transport).await;
    let pending = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke_value("reset", vec![], Shape::Int).await }
    });
    transport.next_sent().await;

    transport.receive_message(&frames(&[r#"{"type":3,"invocationId":"1"}"#]));

    assert_eq!(pending.await??, Value::Nil);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn server_error_fails_the_invocation(transport: Arc<MockTransport>) -> TestResult {
    let connection = connected(&transport).await;
    let pending = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke("explode", vec![]).await }
    });
    transport.next_sent().await;

    transport.receive_message(&frames(&[r#"{"type":3,"invocationId":"1","error":"kaboom"}"#]));

    assert_eq!(pending.await?, Err(HubError::Invocation("kaboom".into())));
    assert_eq!(connection.connection_state(), HubConnectionState::Connected);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn result_of_wrong_shape_fails_the_invocation(transport: Arc<MockTransport>) -> TestResult {
    let connection = connected(&transport).await;
    let pending = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke_value("count", vec![], Shape::Int).await }
    });
    transport.next_sent().await;

    transport.receive_message(&frames(&[r#"{"type":3,"invocationId":"1","result":"many"}"#]));

    assert!(matches!(pending.await?, Err(HubError::Binding(_))));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn stop_cancels_pending_invocations(transport: Arc<MockTransport>) -> TestResult {
    let connection = connected(&transport).await;
    let pending = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke("slow", vec![]).await }
    });
    transport.next_sent().await;

    connection.stop().await?;

    let err = pending.await?.expect_err("canceled by stop");
    assert_eq!(err, HubError::Canceled);
    assert_eq!(err.to_string(), "Invocation was canceled.");
    Ok(())
}

#[rstest]
#[tokio::test]
async fn transport_failure_fails_pending_invocations(transport: Arc<MockTransport>) -> TestResult {
    let connection = connected(&transport).await;
    let pending = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke("slow", vec![]).await }
    });
    transport.next_sent().await;

    transport.close(Some("reset by peer"));

    assert_eq!(
        pending.await?,
        Err(HubError::ConnectionClosed("reset by peer".into()))
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn completion_with_result_and_error_closes_connection(
    transport: Arc<MockTransport>,
) -> TestResult {
    let connection = connected(&transport).await;
    let pending = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke("odd", vec![]).await }
    });
    transport.next_sent().await;

    transport.receive_message(&frames(&[
        r#"{"type":3,"invocationId":"1","result":1,"error":"both"}"#,
    ]));

    let err = pending.await?.expect_err("protocol violation");
    assert!(
        err.to_string()
            .contains("Expected either 'error' or 'result' to be provided, but not both."),
        "unexpected error: {err}"
    );
    assert!(
        eventually(|| connection.connection_state() == HubConnectionState::Disconnected).await
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn unsolicited_completion_is_ignored(transport: Arc<MockTransport>) -> TestResult {
    let connection = connected(&transport).await;

    transport.receive_message(&frames(&[r#"{"type":3,"invocationId":"42","result":1}"#]));

    assert_eq!(connection.connection_state(), HubConnectionState::Connected);
    connection.send("still", vec![]).await?;
    assert_eq!(
        transport.next_sent_message().await,
        frames(&[r#"{"type":1,"target":"still","arguments":[]}"#])
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn ids_are_shared_across_invoke_stream_and_uploads(
    transport: Arc<MockTransport>,
) -> TestResult {
    let connection = connected(&transport).await;
    let _invoke = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke("first", vec![]).await }
    });
    assert!(transport.next_sent_message().await.contains(r#""invocationId":"1""#));

    let _stream = connection.stream("second", vec![], Shape::Any).await?;
    assert!(transport.next_sent_message().await.contains(r#""invocationId":"2""#));

    connection
        .send("third", vec![UploadSource::from_items(vec![]).into()])
        .await?;
    assert_eq!(
        transport.next_sent_message().await,
        frames(&[r#"{"type":1,"target":"third","arguments":[],"streamIds":["3"]}"#])
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn send_failure_stops_the_connection(transport: Arc<MockTransport>) -> TestResult {
    let connection = connected(&transport).await;
    transport.fail_sends(Some("broken pipe"));

    let err = connection.send("inc", vec![]).await.expect_err("send fails");

    assert_eq!(err, HubError::Transport("failed to send payload: broken pipe".into()));
    assert!(
        eventually(|| connection.connection_state() == HubConnectionState::Disconnected).await
    );
    Ok(())
}
