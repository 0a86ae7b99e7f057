//! Route-table [`HttpClient`] for negotiate and long-polling tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use hubwire::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse};

type Handler =
    Arc<dyn Fn(HttpRequest) -> BoxFuture<'static, Result<HttpResponse, HttpError>> + Send + Sync>;

struct Route {
    method: HttpMethod,
    url: Option<String>,
    handler: Handler,
}

/// Answers requests from registered routes and records every request.
///
/// Routes matching method and URL win over method-only routes; among equals
/// the most recently added wins. Unmatched requests fail with
/// [`HttpError::Request`].
///
/// ```rust
/// use hubwire::{HttpMethod, HttpResponse};
/// use hubwire_testing::TestHttpClient;
///
/// let client = TestHttpClient::new().on(
///     HttpMethod::Post,
///     "http://example.com/negotiate?negotiateVersion=1",
///     |_| Ok(HttpResponse::new(200, r#"{"url":"http://other.example.com"}"#)),
/// );
/// assert!(client.requests().is_empty());
/// ```
#[derive(Default)]
pub struct TestHttpClient {
    routes: Vec<Route>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl TestHttpClient {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Answer `method` requests to exactly `url`.
    #[must_use]
    pub fn on<F>(self, method: HttpMethod, url: impl Into<String>, handler: F) -> Self
    where
        F: Fn(HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync + 'static,
    {
        self.route(method, Some(url.into()), move |request| {
            let response = handler(request);
            Box::pin(async move { response })
        })
    }

    /// Answer `method` requests to any URL.
    #[must_use]
    pub fn on_method<F>(self, method: HttpMethod, handler: F) -> Self
    where
        F: Fn(HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync + 'static,
    {
        self.route(method, None, move |request| {
            let response = handler(request);
            Box::pin(async move { response })
        })
    }

    /// Answer `method` requests to `url` with a future, for slow responses.
    #[must_use]
    pub fn on_async<F, Fut>(self, method: HttpMethod, url: impl Into<String>, handler: F) -> Self
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, HttpError>> + Send + 'static,
    {
        self.route(method, Some(url.into()), move |request| Box::pin(handler(request)))
    }

    fn route<F>(mut self, method: HttpMethod, url: Option<String>, handler: F) -> Self
    where
        F: Fn(HttpRequest) -> BoxFuture<'static, Result<HttpResponse, HttpError>>
            + Send
            + Sync
            + 'static,
    {
        self.routes.push(Route {
            method,
            url,
            handler: Arc::new(handler),
        });
        self
    }

    fn log(&self) -> MutexGuard<'_, Vec<HttpRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every request received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> { self.log().clone() }

    fn find(&self, request: &HttpRequest) -> Option<Handler> {
        let candidates = || self.routes.iter().rev().filter(|r| r.method == request.method);
        candidates()
            .find(|r| r.url.as_deref() == Some(request.url.as_str()))
            .or_else(|| candidates().find(|r| r.url.is_none()))
            .map(|r| Arc::clone(&r.handler))
    }
}

#[async_trait]
impl HttpClient for TestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.log().push(request.clone());
        match self.find(&request) {
            Some(handler) => handler(request).await,
            None => Err(HttpError::Request(format!(
                "no route for {} {}",
                request.method.as_str(),
                request.url
            ))),
        }
    }
}
