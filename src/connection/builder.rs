//! Builder for [`HubConnection`].

use std::{
    sync::{Arc, Mutex, atomic::AtomicU64},
    time::Duration,
};

use futures::FutureExt;

use super::{AccessTokenProvider, HubConnection, Inner, config::ConnectionConfig, state::Shared};
use crate::{
    error::HubError,
    handlers::CallbackMap,
    http::{HttpClient, HttpHeaders, ReqwestHttpClient},
    message::{CloseMessage, HubMessage},
    protocol::{HubProtocol, JsonHubProtocol},
    stream::BoxError,
    transport::{Transport, TransportKind},
};

/// Configures and creates a [`HubConnection`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use hubwire::{HubConnectionBuilder, MessagePackHubProtocol, TransportKind};
///
/// let connection = HubConnectionBuilder::new("http://localhost:5000/chat")
///     .with_hub_protocol(MessagePackHubProtocol::default())
///     .with_transport(TransportKind::WebSockets)
///     .server_timeout(Duration::from_secs(60))
///     .build()
///     .expect("valid configuration");
/// assert_eq!(connection.server_timeout(), Duration::from_secs(60));
/// ```
pub struct HubConnectionBuilder {
    url: String,
    protocol: Arc<dyn HubProtocol>,
    config: ConnectionConfig,
    transport: Option<Arc<dyn Transport>>,
    http: Option<Arc<dyn HttpClient>>,
    access_token: Option<AccessTokenProvider>,
}

impl HubConnectionBuilder {
    /// Start configuring a connection to the hub at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocol: Arc::new(JsonHubProtocol),
            config: ConnectionConfig::default(),
            transport: None,
            http: None,
            access_token: None,
        }
    }

    /// Use `protocol` instead of JSON.
    #[must_use]
    pub fn with_hub_protocol(mut self, protocol: impl HubProtocol + 'static) -> Self {
        self.protocol = Arc::new(protocol);
        self
    }

    /// Restrict which built-in transport negotiation may pick.
    #[must_use]
    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.config.transport = kind;
        self
    }

    /// Use `transport` for every attempt instead of a built-in one.
    #[must_use]
    pub fn with_transport_implementation(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Connect the transport straight to the URL without negotiating.
    ///
    /// Only valid with [`TransportKind::WebSockets`] or a custom transport;
    /// `start` fails otherwise.
    #[must_use]
    pub fn skip_negotiation(mut self, skip: bool) -> Self {
        self.config.skip_negotiation = skip;
        self
    }

    /// Send `name: value` with negotiate and transport requests.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HttpHeaders) -> Self {
        self.config.headers.extend(headers);
        self
    }

    /// Fetch a bearer token before each start.
    ///
    /// ```
    /// use hubwire::HubConnectionBuilder;
    ///
    /// let builder = HubConnectionBuilder::new("http://localhost:5000/chat")
    ///     .with_access_token_provider(|| async { Ok(Some("secret".to_owned())) });
    /// let _ = builder;
    /// ```
    #[must_use]
    pub fn with_access_token_provider<F, Fut>(mut self, provider: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, BoxError>> + Send + 'static,
    {
        self.access_token = Some(Arc::new(move || provider().boxed()));
        self
    }

    /// HTTP client for negotiation and long polling.
    #[must_use]
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = Some(client);
        self
    }

    /// Close the connection when the server is silent for `timeout`.
    #[must_use]
    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.config.server_timeout = timeout;
        self
    }

    /// Ping the server when nothing was sent for `interval`.
    #[must_use]
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    #[must_use]
    pub fn handshake_response_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Timeout of each negotiate request.
    #[must_use]
    pub fn negotiate_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiate_timeout = timeout;
        self
    }

    /// Number of tasks running result-producing handlers.
    #[must_use]
    pub fn handler_workers(mut self, workers: usize) -> Self {
        self.config.handler_workers = workers.max(1);
        self
    }

    /// How often the keep-alive deadlines are checked.
    #[doc(hidden)]
    #[must_use]
    pub fn tick_rate(mut self, rate: Duration) -> Self {
        self.config.tick_rate = rate;
        self
    }

    /// Create the connection in the `Disconnected` state.
    ///
    /// # Errors
    ///
    /// Returns a usage error for an empty URL, or a protocol error if the
    /// hub protocol cannot encode its own control messages.
    pub fn build(self) -> Result<HubConnection, HubError> {
        if self.url.is_empty() {
            return Err(HubError::Usage("A valid url is required.".into()));
        }
        let ping = self.protocol.write_message(&HubMessage::Ping)?;
        let close = self
            .protocol
            .write_message(&HubMessage::Close(CloseMessage::default()))?;
        let http = self
            .http
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::default()));
        tracing::debug!(url = %self.url, protocol = %self.protocol.name(), "building HubConnection");
        let inner = Inner {
            config: self.config,
            protocol: self.protocol,
            ping,
            close,
            http,
            custom_transport: self.transport,
            access_token: self.access_token,
            handlers: Arc::new(CallbackMap::default()),
            on_closed: Mutex::new(Vec::new()),
            shared: Mutex::new(Shared {
                base_url: self.url,
                ..Shared::default()
            }),
            next_attempt: AtomicU64::new(0),
        };
        Ok(HubConnection {
            inner: Arc::new(inner),
        })
    }
}

impl std::fmt::Debug for HubConnectionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnectionBuilder")
            .field("url", &self.url)
            .field("protocol", &self.protocol.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
