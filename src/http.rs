//! HTTP client abstraction used for negotiate and long polling.
//!
//! [`ReqwestHttpClient`] is the default implementation. Tests substitute
//! their own [`HttpClient`] to script server responses.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

/// Header names and values for one request.
pub type HttpHeaders = BTreeMap<String, String>;

/// Request methods used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HttpHeaders,
    pub body: Option<Bytes>,
    /// Per-request timeout; `None` uses the client's default.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    #[must_use]
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HttpHeaders::new(),
            body: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn headers(mut self, headers: HttpHeaders) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub body: Bytes,
}

impl HttpResponse {
    /// Response with the canonical reason phrase left empty.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_text: String::new(),
            body: body.into(),
        }
    }
}

/// Errors raised by an [`HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum HttpError {
    #[error("HTTP request timed out")]
    Timeout,
    #[error("HTTP request failed: {0}")]
    Request(String),
}

/// Sends a single HTTP request.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// # Errors
    ///
    /// Returns [`HttpError`] when no response could be obtained. Non-2xx
    /// statuses are returned as responses, not errors.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self { Self { client } }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        tracing::debug!(method = request.method.as_str(), url = %request.url, "sending HTTP request");
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout
    } else {
        HttpError::Request(err.to_string())
    }
}
