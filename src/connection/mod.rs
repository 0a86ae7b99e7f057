//! The hub connection: lifecycle, invocations and handler dispatch.
//!
//! [`HubConnection`] is a cheap handle over shared state. All mutation of the
//! current attempt happens under one `std::sync::Mutex` that is never held
//! across an `.await`; encoding, decoding and user callbacks run outside it.
//! Outbound payloads are queued to a writer task per attempt, so the order in
//! which callers enqueue is the order the transport sees.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, atomic::AtomicU64},
    time::Duration,
};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
    error::HubError,
    handlers::{CallbackMap, HandlerAction, Subscription},
    http::HttpClient,
    message::HubMessage,
    protocol::HubProtocol,
    stream::{BoxError, HubArgument, HubStream},
    transport::Transport,
    value::{Shape, Value},
};

mod builder;
mod config;
mod dispatch;
mod keep_alive;
mod lifecycle;
mod outbound;
mod receive;
mod state;

pub use builder::HubConnectionBuilder;
use config::ConnectionConfig;
pub use state::HubConnectionState;
use state::Shared;

/// Supplies the bearer token sent with negotiate and transport requests.
///
/// Called once per `start`; `Ok(None)` sends no `Authorization` header.
pub type AccessTokenProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<String>, BoxError>> + Send + Sync>;

/// Observer of connection closure; receives the terminal error, if any.
pub type ClosedCallback = Arc<dyn Fn(Option<&HubError>) + Send + Sync>;

pub(crate) struct Inner {
    config: ConnectionConfig,
    protocol: Arc<dyn HubProtocol>,
    /// Encoded ping and close messages, identical for every attempt.
    ping: Bytes,
    close: Bytes,
    http: Arc<dyn HttpClient>,
    custom_transport: Option<Arc<dyn Transport>>,
    access_token: Option<AccessTokenProvider>,
    handlers: Arc<CallbackMap>,
    on_closed: Mutex<Vec<ClosedCallback>>,
    shared: Mutex<Shared>,
    next_attempt: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_callbacks(&self) -> Vec<ClosedCallback> {
        self.on_closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn encode(&self, message: &HubMessage) -> Result<Bytes, HubError> {
        Ok(self.protocol.write_message(message)?)
    }
}

/// A client connection to a hub.
///
/// Cloning yields another handle to the same connection.
///
/// ```no_run
/// use hubwire::{HubConnectionBuilder, Value};
///
/// # async fn run() -> Result<(), hubwire::HubError> {
/// let connection = HubConnectionBuilder::new("http://localhost:5000/chat").build()?;
/// let _greetings = connection.on("greet", |args: Vec<Value>| println!("{args:?}"));
/// connection.start().await?;
/// connection.send("broadcast", vec!["hello".into()]).await?;
/// connection.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

impl HubConnection {
    /// Connect to the hub.
    ///
    /// Negotiates, starts the transport and completes the handshake.
    /// Calling `start` while a start is in flight returns that start's
    /// outcome; calling it while connected succeeds immediately.
    ///
    /// # Errors
    ///
    /// Fails with the negotiate, transport or handshake error that stopped
    /// the attempt, or with a `ConnectionClosed` error when `stop` wins the
    /// race. The connection is `Disconnected` afterwards.
    pub async fn start(&self) -> Result<(), HubError> { Arc::clone(&self.inner).start().await }

    /// Disconnect; a no-op when already disconnected.
    ///
    /// Pending invocations fail with [`HubError::Canceled`] and the close
    /// callbacks run before this returns.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; transport stop failures are logged.
    pub async fn stop(&self) -> Result<(), HubError> { self.inner.stop_with(None, None).await }

    /// Invoke `target` without waiting for a reply.
    ///
    /// Resolves once the message has been handed to the transport.
    ///
    /// # Errors
    ///
    /// Fails with a usage error unless connected, or with the transport's
    /// send error.
    pub async fn send(&self, target: &str, arguments: Vec<HubArgument>) -> Result<(), HubError> {
        self.inner.send(target, arguments).await
    }

    /// Invoke `target` and wait for its completion, discarding any result.
    ///
    /// # Errors
    ///
    /// Fails with the server's error text, a usage error unless connected,
    /// or the cancellation or closure that ended the connection first.
    pub async fn invoke(&self, target: &str, arguments: Vec<HubArgument>) -> Result<(), HubError> {
        self.inner.invoke(target, arguments, Shape::Any).await.map(|_| ())
    }

    /// Invoke `target` and return its result bound to `result_shape`.
    ///
    /// A completion without a result yields [`Value::Nil`].
    ///
    /// # Errors
    ///
    /// As [`HubConnection::invoke`], plus a binding error when the result
    /// does not fit `result_shape`.
    pub async fn invoke_value(
        &self,
        target: &str,
        arguments: Vec<HubArgument>,
        result_shape: Shape,
    ) -> Result<Value, HubError> {
        self.inner.invoke(target, arguments, result_shape).await
    }

    /// Start a server-to-client stream of items bound to `item_shape`.
    ///
    /// # Errors
    ///
    /// Fails with a usage error unless connected; server errors arrive
    /// through the returned stream.
    pub async fn stream(
        &self,
        target: &str,
        arguments: Vec<HubArgument>,
        item_shape: Shape,
    ) -> Result<HubStream, HubError> {
        self.inner.stream(target, arguments, item_shape).await
    }

    /// Register a handler for server invocations of `target`.
    ///
    /// Arguments arrive untyped; use [`HubConnection::on_typed`] to declare
    /// their shapes.
    pub fn on<F>(&self, target: &str, handler: F) -> Subscription
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        tracing::debug!(method = %target, "registered handler");
        self.inner.handlers.put_action(target, None, Arc::new(handler))
    }

    /// Register a handler whose arguments are bound to `shapes`.
    ///
    /// The shapes of the first handler registered for a target decide how
    /// its arguments decode.
    pub fn on_typed<F>(&self, target: &str, shapes: Vec<Shape>, handler: F) -> Subscription
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        tracing::debug!(method = %target, "registered typed handler");
        self.inner.handlers.put_action(target, Some(shapes), Arc::new(handler))
    }

    /// Register the handler that answers server invocations of `target`.
    ///
    /// # Errors
    ///
    /// Fails with a usage error if `target` already has a result handler.
    pub fn on_with_result<F, Fut>(
        &self,
        target: &str,
        shapes: Vec<Shape>,
        handler: F,
    ) -> Result<Subscription, HubError>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        let action = HandlerAction::Result(Arc::new(move |args| Box::pin(handler(args))));
        let subscription = self.inner.handlers.put(target, Some(shapes), action)?;
        tracing::debug!(method = %target, "registered result handler");
        Ok(subscription)
    }

    /// Remove every handler registered for `target`.
    pub fn remove(&self, target: &str) { self.inner.handlers.remove(target); }

    /// Observe connection closure. Callbacks run in registration order.
    pub fn on_closed<F>(&self, callback: F)
    where
        F: Fn(Option<&HubError>) + Send + Sync + 'static,
    {
        self.inner
            .on_closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    #[must_use]
    pub fn connection_state(&self) -> HubConnectionState { self.inner.lock().state }

    /// Id assigned by the server during negotiation, while connected.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        let shared = self.inner.lock();
        shared.current.as_ref().and_then(|cs| cs.connection_id.clone())
    }

    #[must_use]
    pub fn base_url(&self) -> String { self.inner.lock().base_url.clone() }

    /// Change the URL used by the next `start`.
    ///
    /// # Errors
    ///
    /// Fails with a usage error unless disconnected, or when `url` is empty.
    pub fn set_base_url(&self, url: impl Into<String>) -> Result<(), HubError> {
        let url = url.into();
        if url.is_empty() {
            return Err(HubError::Usage("The HubConnection url must be a valid url.".into()));
        }
        let mut shared = self.inner.lock();
        if shared.state != HubConnectionState::Disconnected {
            return Err(HubError::Usage(
                "The HubConnection must be in the disconnected state to change the url.".into(),
            ));
        }
        shared.base_url = url;
        Ok(())
    }

    #[must_use]
    pub fn server_timeout(&self) -> Duration { self.inner.config.server_timeout }

    #[must_use]
    pub fn keep_alive_interval(&self) -> Duration { self.inner.config.keep_alive_interval }

    #[must_use]
    pub fn handshake_response_timeout(&self) -> Duration { self.inner.config.handshake_timeout }
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("HubConnection")
            .field("base_url", &shared.base_url)
            .field("state", &shared.state)
            .field("protocol", &self.inner.protocol.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
