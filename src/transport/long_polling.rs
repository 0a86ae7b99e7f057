//! Long-polling transport over an [`HttpClient`].
//!
//! Inbound payloads arrive as responses to repeated GET requests; outbound
//! payloads are POSTed. A 204 response means the server ended the
//! connection. Stopping sends a DELETE.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{Callbacks, CloseCallback, ReceiveCallback, Transport, TransportError};
use crate::http::{HttpClient, HttpError, HttpHeaders, HttpMethod, HttpRequest};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(100);

pub struct LongPollingTransport {
    headers: HttpHeaders,
    client: Arc<dyn HttpClient>,
    poll_timeout: Duration,
    url: std::sync::Mutex<Option<String>>,
    shutdown: std::sync::Mutex<CancellationToken>,
    callbacks: Arc<Callbacks>,
}

impl LongPollingTransport {
    #[must_use]
    pub fn new(headers: HttpHeaders, client: Arc<dyn HttpClient>) -> Self {
        Self {
            headers,
            client,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            url: std::sync::Mutex::new(None),
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
            callbacks: Arc::new(Callbacks::default()),
        }
    }

    /// Timeout applied to each poll request.
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn url(&self) -> Result<String, TransportError> {
        self.url
            .lock()
            .ok()
            .and_then(|url| url.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn poll_request(&self, url: &str) -> HttpRequest {
        HttpRequest::new(HttpMethod::Get, url)
            .headers(self.headers.clone())
            .timeout(self.poll_timeout)
    }
}

#[async_trait]
impl Transport for LongPollingTransport {
    async fn start(&self, url: &str) -> Result<(), TransportError> {
        tracing::debug!(url = %url, "starting long polling transport");
        let response = self.client.send(self.poll_request(url)).await?;
        if response.status != 200 {
            return Err(TransportError::Connect(format!(
                "Unexpected response code {}.",
                response.status
            )));
        }
        if let Ok(mut slot) = self.url.lock() {
            *slot = Some(url.to_owned());
        }
        let shutdown = CancellationToken::new();
        if let Ok(mut slot) = self.shutdown.lock() {
            *slot = shutdown.clone();
        }
        self.callbacks.reset();

        let client = Arc::clone(&self.client);
        let callbacks = Arc::clone(&self.callbacks);
        let request = self.poll_request(url);
        tokio::spawn(async move {
            let error = loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break None,
                    response = client.send(request.clone()) => match response {
                        Ok(r) if r.status == 204 => {
                            tracing::debug!("long polling transport closed by server");
                            break None;
                        }
                        Ok(r) if r.status == 200 => {
                            if !r.body.is_empty() {
                                callbacks.receive(r.body);
                            }
                        }
                        Ok(r) => break Some(format!("Unexpected response code {}.", r.status)),
                        Err(HttpError::Timeout) => {}
                        Err(e) => break Some(e.to_string()),
                    },
                }
            };
            callbacks.close(error);
        });
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let url = self.url()?;
        let request = HttpRequest::new(HttpMethod::Post, url)
            .headers(self.headers.clone())
            .body(payload);
        let response = self.client.send(request).await?;
        if response.status == 200 {
            Ok(())
        } else {
            Err(TransportError::Send(format!(
                "Unexpected response code {}.",
                response.status
            )))
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if let Ok(shutdown) = self.shutdown.lock() {
            shutdown.cancel();
        }
        let url = self.url.lock().ok().and_then(|mut url| url.take());
        if let Some(url) = url {
            let request = HttpRequest::new(HttpMethod::Delete, url).headers(self.headers.clone());
            if let Err(e) = self.client.send(request).await {
                tracing::debug!(error = %e, "long polling DELETE failed");
            }
        }
        self.callbacks.close(None);
        Ok(())
    }

    fn set_on_receive(&self, callback: ReceiveCallback) { self.callbacks.set_on_receive(callback); }

    fn set_on_close(&self, callback: CloseCallback) { self.callbacks.set_on_close(callback); }
}
