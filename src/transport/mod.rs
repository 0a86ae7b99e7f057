//! Duplex byte transports carrying hub protocol payloads.
//!
//! The connection drives a [`Transport`] through `start`, `send` and `stop`
//! and learns about inbound payloads and closure through the callbacks it
//! installs before starting.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::HubError, http::HttpError};

mod long_polling;
mod websocket;

pub use long_polling::LongPollingTransport;
pub use websocket::WebSocketTransport;

/// Invoked with every inbound payload.
pub type ReceiveCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Invoked once when the transport closes, with the failure if any.
pub type CloseCallback = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// Which transport the connection may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Prefer WebSockets, fall back to long polling.
    #[default]
    All,
    WebSockets,
    LongPolling,
}

impl TransportKind {
    /// Name used in negotiate responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::All => "All",
            TransportKind::WebSockets => "WebSockets",
            TransportKind::LongPolling => "LongPolling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Errors raised by transports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("failed to connect transport: {0}")]
    Connect(String),
    #[error("failed to send payload: {0}")]
    Send(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error(transparent)]
    Http(#[from] HttpError),
}

impl From<TransportError> for HubError {
    fn from(err: TransportError) -> Self { HubError::Transport(err.to_string()) }
}

/// An async duplex byte channel.
///
/// The connection never calls `send` before `start` has completed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `url`.
    async fn start(&self, url: &str) -> Result<(), TransportError>;

    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Disconnect; the close callback fires once the transport is down.
    async fn stop(&self) -> Result<(), TransportError>;

    fn set_on_receive(&self, callback: ReceiveCallback);

    fn set_on_close(&self, callback: CloseCallback);
}

/// Callback slots shared by the built-in transports.
#[derive(Default)]
pub(crate) struct Callbacks {
    on_receive: std::sync::Mutex<Option<ReceiveCallback>>,
    on_close: std::sync::Mutex<Option<CloseCallback>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Callbacks {
    pub(crate) fn set_on_receive(&self, callback: ReceiveCallback) {
        if let Ok(mut slot) = self.on_receive.lock() {
            *slot = Some(callback);
        }
    }

    pub(crate) fn set_on_close(&self, callback: CloseCallback) {
        if let Ok(mut slot) = self.on_close.lock() {
            *slot = Some(callback);
        }
    }

    /// Re-arm the close callback for a new start.
    pub(crate) fn reset(&self) { self.closed.store(false, std::sync::atomic::Ordering::SeqCst); }

    pub(crate) fn receive(&self, payload: Bytes) {
        let callback = self.on_receive.lock().ok().and_then(|slot| slot.clone());
        if let Some(callback) = callback {
            callback(payload);
        }
    }

    /// Fire the close callback at most once per start.
    pub(crate) fn close(&self, error: Option<String>) {
        if self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let callback = self.on_close.lock().ok().and_then(|slot| slot.clone());
        if let Some(callback) = callback {
            callback(error);
        }
    }
}
