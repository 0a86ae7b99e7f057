//! In-memory [`Transport`] driven by the test.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use hubwire::{
    CloseCallback,
    HubMessage,
    HubProtocol,
    JsonHubProtocol,
    MessagePackHubProtocol,
    ReceiveCallback,
    Transport,
    TransportError,
};
use tokio::sync::{Semaphore, mpsc};

/// How long [`MockTransport::next_sent`] waits before failing the test.
const SENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    on_receive: Option<ReceiveCallback>,
    on_close: Option<CloseCallback>,
    url: Option<String>,
    open: bool,
    awaiting_handshake: bool,
    send_error: Option<String>,
    sent: Vec<Bytes>,
    starts: usize,
    stops: usize,
}

/// A transport that records what the connection sends.
///
/// By default the first payload after each `start` is answered with an
/// empty handshake response and outgoing pings are not recorded.
pub struct MockTransport {
    handshake: Option<Bytes>,
    ignore_pings: bool,
    start_error: Option<String>,
    hold_start: bool,
    pings: [Bytes; 2],
    state: Mutex<State>,
    start_gate: Semaphore,
    sent_tx: mpsc::UnboundedSender<Bytes>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let ping = |protocol: &dyn HubProtocol| {
            protocol.write_message(&HubMessage::Ping).unwrap_or_default()
        };
        Self {
            handshake: Some(Bytes::from_static(b"{}\x1e")),
            ignore_pings: true,
            start_error: None,
            hold_start: false,
            pings: [ping(&JsonHubProtocol), ping(&MessagePackHubProtocol)],
            state: Mutex::new(State::default()),
            start_gate: Semaphore::new(0),
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
        }
    }

    /// Never answer the handshake; the test replies itself, or not at all.
    #[must_use]
    pub fn without_handshake(mut self) -> Self {
        self.handshake = None;
        self
    }

    /// Answer the handshake with `response` instead of `{}`.
    #[must_use]
    pub fn with_handshake_response(mut self, response: impl Into<Bytes>) -> Self {
        self.handshake = Some(response.into());
        self
    }

    /// Record outgoing pings alongside other payloads.
    #[must_use]
    pub fn with_pings(mut self) -> Self {
        self.ignore_pings = false;
        self
    }

    /// Fail every `start` with `error`.
    #[must_use]
    pub fn failing_start(mut self, error: impl Into<String>) -> Self {
        self.start_error = Some(error.into());
        self
    }

    /// Block `start` until [`MockTransport::release_start`] is called.
    #[must_use]
    pub fn holding_start(mut self) -> Self {
        self.hold_start = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let one held `start` complete.
    pub fn release_start(&self) { self.start_gate.add_permits(1); }

    /// Fail subsequent sends with `error`, or stop failing with `None`.
    pub fn fail_sends(&self, error: Option<&str>) { self.lock().send_error = error.map(str::to_owned); }

    /// Deliver `message` as one inbound text payload.
    pub fn receive_message(&self, message: &str) {
        self.receive_bytes(Bytes::copy_from_slice(message.as_bytes()));
    }

    /// Deliver `payload` as one inbound payload.
    pub fn receive_bytes(&self, payload: impl Into<Bytes>) {
        let callback = self.lock().on_receive.clone();
        if let Some(callback) = callback {
            callback(payload.into());
        }
    }

    /// Simulate the transport closing, as the server or network would.
    pub fn close(&self, error: Option<&str>) {
        let callback = {
            let mut state = self.lock();
            if !std::mem::take(&mut state.open) {
                return;
            }
            state.on_close.clone()
        };
        if let Some(callback) = callback {
            callback(error.map(str::to_owned));
        }
    }

    /// Every recorded payload, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<Bytes> { self.lock().sent.clone() }

    /// Recorded payloads as text, oldest first.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|payload| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    /// Wait for the next recorded payload.
    ///
    /// # Panics
    ///
    /// Panics if nothing is sent within five seconds.
    pub async fn next_sent(&self) -> Bytes {
        self.next_sent_within(SENT_TIMEOUT)
            .await
            .expect("timed out waiting for the connection to send")
    }

    /// Wait up to `timeout` for the next recorded payload.
    pub async fn next_sent_within(&self, timeout: Duration) -> Option<Bytes> {
        let mut rx = self.sent_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Wait for the next recorded payload and decode it as text.
    pub async fn next_sent_message(&self) -> String {
        String::from_utf8_lossy(&self.next_sent().await).into_owned()
    }

    /// URL passed to the latest `start`.
    #[must_use]
    pub fn start_url(&self) -> Option<String> { self.lock().url.clone() }

    #[must_use]
    pub fn start_count(&self) -> usize { self.lock().starts }

    #[must_use]
    pub fn stop_count(&self) -> usize { self.lock().stops }
}

impl Default for MockTransport {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, url: &str) -> Result<(), TransportError> {
        {
            let mut state = self.lock();
            state.starts += 1;
            state.url = Some(url.to_owned());
        }
        if self.hold_start {
            if let Ok(permit) = self.start_gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(error) = &self.start_error {
            return Err(TransportError::Connect(error.clone()));
        }
        let mut state = self.lock();
        state.open = true;
        state.awaiting_handshake = true;
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let reply = {
            let mut state = self.lock();
            if !state.open {
                return Err(TransportError::NotConnected);
            }
            if let Some(error) = &state.send_error {
                return Err(TransportError::Send(error.clone()));
            }
            if self.ignore_pings && self.pings.contains(&payload) {
                return Ok(());
            }
            state.sent.push(payload.clone());
            let _ = self.sent_tx.send(payload);
            if std::mem::take(&mut state.awaiting_handshake) {
                self.handshake.clone()
            } else {
                None
            }
        };
        if let Some(reply) = reply {
            self.receive_bytes(reply);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.lock().stops += 1;
        self.close(None);
        Ok(())
    }

    fn set_on_receive(&self, callback: ReceiveCallback) { self.lock().on_receive = Some(callback); }

    fn set_on_close(&self, callback: CloseCallback) { self.lock().on_close = Some(callback); }
}
