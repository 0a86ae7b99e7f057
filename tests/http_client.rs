//! Integration tests for the reqwest-backed HTTP client.

use std::{sync::Arc, time::Duration};

use hubwire::{
    HttpClient,
    HttpError,
    HttpMethod,
    HttpRequest,
    HubConnectionBuilder,
    ReqwestHttpClient,
};
use hubwire_testing::MockTransport;
use wiremock::{
    Mock,
    MockServer,
    ResponseTemplate,
    matchers::{body_string, header, method, path, query_param},
};

mod common;
use common::TestResult;

#[tokio::test]
async fn request_carries_headers_and_body() -> TestResult {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/poll"))
        .and(header("X-Test", "yes"))
        .and(body_string("payload"))
        .respond_with(ResponseTemplate::new(200).set_body_string("reply"))
        .expect(1)
        .mount(&server)
        .await;
    let client = ReqwestHttpClient::default();

    let response = client
        .send(
            HttpRequest::new(HttpMethod::Post, format!("{}/poll", server.uri()))
                .headers([("X-Test".to_owned(), "yes".to_owned())].into_iter().collect())
                .body("payload".into()),
        )
        .await?;

    assert_eq!(response.status, 200);
    assert_eq!(response.status_text, "OK");
    assert_eq!(&response.body[..], b"reply");
    Ok(())
}

#[tokio::test]
async fn error_statuses_are_responses() -> TestResult {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let response = ReqwestHttpClient::default()
        .send(HttpRequest::new(HttpMethod::Get, server.uri()))
        .await?;

    assert_eq!(response.status, 404);
    assert_eq!(response.status_text, "Not Found");
    Ok(())
}

#[tokio::test]
async fn slow_response_times_out() -> TestResult {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let err = ReqwestHttpClient::default()
        .send(HttpRequest::new(HttpMethod::Get, server.uri()).timeout(Duration::from_millis(50)))
        .await
        .expect_err("request times out");

    assert_eq!(err, HttpError::Timeout);
    Ok(())
}

#[tokio::test]
async fn connection_negotiates_over_http() -> TestResult {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hub/negotiate"))
        .and(query_param("negotiateVersion", "1"))
        .and(header("Authorization", "Bearer abc"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"negotiateVersion":1,"connectionId":"c1","connectionToken":"t1","availableTransports":[{"transport":"WebSockets","transferFormats":["Text"]}]}"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    let transport = Arc::new(MockTransport::new());
    let connection = HubConnectionBuilder::new(format!("{}/hub", server.uri()))
        .with_transport_implementation(transport.clone())
        .with_access_token_provider(|| async { Ok(Some("abc".to_owned())) })
        .build()?;

    connection.start().await?;

    assert_eq!(
        transport.start_url(),
        Some(format!("{}/hub?id=t1", server.uri()))
    );
    assert_eq!(connection.connection_id().as_deref(), Some("c1"));
    connection.stop().await?;
    Ok(())
}
