//! WebSocket transport over `tokio-tungstenite`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::Mutex;
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
    tungstenite::{self, Message, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;

use super::{Callbacks, CloseCallback, ReceiveCallback, Transport, TransportError};
use crate::{http::HttpHeaders, protocol::TransferFormat};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Transport speaking WebSockets, sending text or binary frames to match
/// the hub protocol's transfer format.
pub struct WebSocketTransport {
    headers: HttpHeaders,
    format: TransferFormat,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    shutdown: std::sync::Mutex<CancellationToken>,
    callbacks: Arc<Callbacks>,
}

impl WebSocketTransport {
    #[must_use]
    pub fn new(headers: HttpHeaders, format: TransferFormat) -> Self {
        Self {
            headers,
            format,
            sink: Mutex::new(None),
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
            callbacks: Arc::new(Callbacks::default()),
        }
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .map(|token| token.clone())
            .unwrap_or_default()
    }
}

/// Convert an `http(s)` URL to the matching `ws(s)` scheme.
#[must_use]
pub fn to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_owned()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(&self, url: &str) -> Result<(), TransportError> {
        let url = to_ws_scheme(url);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        for (name, value) in &self.headers {
            let name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let value = tungstenite::http::HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }
        tracing::debug!(url = %url, "connecting WebSocket transport");
        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, mut stream) = stream.split();
        *self.sink.lock().await = Some(sink);

        let shutdown = CancellationToken::new();
        if let Ok(mut slot) = self.shutdown.lock() {
            *slot = shutdown.clone();
        }
        self.callbacks.reset();
        let callbacks = Arc::clone(&self.callbacks);
        tokio::spawn(async move {
            let error = loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break None,
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => callbacks.receive(Bytes::from(text)),
                        Some(Ok(Message::Binary(data))) => callbacks.receive(Bytes::from(data)),
                        Some(Ok(Message::Close(_))) | None => break None,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                    },
                }
            };
            tracing::debug!(error = ?error, "WebSocket transport closed");
            callbacks.close(error);
        });
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let message = match self.format {
            TransferFormat::Text => Message::Text(
                String::from_utf8(payload.to_vec())
                    .map_err(|e| TransportError::Send(e.to_string()))?,
            ),
            TransferFormat::Binary => Message::Binary(payload.to_vec()),
        };
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.send(Message::Close(None)).await {
                tracing::debug!(error = %e, "failed to send WebSocket close frame");
            }
        }
        self.shutdown_token().cancel();
        self.callbacks.close(None);
        Ok(())
    }

    fn set_on_receive(&self, callback: ReceiveCallback) { self.callbacks.set_on_receive(callback); }

    fn set_on_close(&self, callback: CloseCallback) { self.callbacks.set_on_close(callback); }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("http://example.com/hub?id=1", "ws://example.com/hub?id=1")]
    #[case("https://example.com", "wss://example.com")]
    #[case("ws://example.com", "ws://example.com")]
    fn http_schemes_map_to_websocket_schemes(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(to_ws_scheme(url), expected);
    }
}
