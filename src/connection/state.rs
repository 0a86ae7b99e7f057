//! Lifecycle state and the per-attempt `ConnectionState`.
//!
//! Everything here is only touched while holding the connection's state
//! lock. A `ConnectionState` lives from `start` until teardown; a later
//! attempt always gets a fresh one with its own invocation counter.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use futures::future::{BoxFuture, Shared as SharedFuture};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use super::dispatch::WorkerPool;
use crate::{
    error::HubError,
    invocation::InvocationTracker,
    transport::{Transport, TransportKind},
};

/// Observable lifecycle state of a [`HubConnection`](super::HubConnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HubConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for HubConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HubConnectionState::Disconnected => "Disconnected",
            HubConnectionState::Connecting => "Connecting",
            HubConnectionState::Connected => "Connected",
        })
    }
}

/// Completion of one `start` call, shared by concurrent callers.
pub(crate) type StartFuture = SharedFuture<BoxFuture<'static, Result<(), HubError>>>;

pub(crate) type Ack = oneshot::Sender<Result<(), HubError>>;

/// A payload queued for the writer task.
pub(crate) struct Outbound {
    pub(crate) payload: Bytes,
    pub(crate) ack: Option<Ack>,
}

/// State guarded by the connection lock.
#[derive(Default)]
pub(crate) struct Shared {
    pub(crate) state: HubConnectionState,
    pub(crate) base_url: String,
    pub(crate) current: Option<ConnectionState>,
}

impl Shared {
    /// The current attempt, if it is still `attempt`.
    pub(crate) fn attempt_mut(&mut self, attempt: u64) -> Option<&mut ConnectionState> {
        self.current.as_mut().filter(|cs| cs.attempt == attempt)
    }

    /// The current attempt if the connection is connected.
    pub(crate) fn connected_mut(&mut self) -> Option<&mut ConnectionState> {
        if self.state == HubConnectionState::Connected {
            self.current.as_mut()
        } else {
            None
        }
    }

    /// Detach `attempt` and mark the connection disconnected.
    pub(crate) fn release(&mut self, attempt: u64) -> Option<ConnectionState> {
        if self.current.as_ref().is_some_and(|cs| cs.attempt == attempt) {
            self.state = HubConnectionState::Disconnected;
            self.current.take()
        } else {
            None
        }
    }
}

/// Resources and bookkeeping of one connection attempt.
pub(crate) struct ConnectionState {
    pub(crate) attempt: u64,
    pub(crate) runtime: Handle,
    /// Cancelled when the attempt is stopped or abandoned.
    pub(crate) shutdown: CancellationToken,
    /// Cancelled once teardown, including close callbacks, has finished.
    pub(crate) finished: CancellationToken,
    pub(crate) start: Option<StartFuture>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) transport_kind: Option<TransportKind>,
    pub(crate) connection_id: Option<String>,
    pub(crate) tracker: InvocationTracker,
    pub(crate) handshake: Option<oneshot::Sender<Result<(), HubError>>>,
    pub(crate) handshake_received: bool,
    /// A handshake failure seen before `start` was waiting for it.
    pub(crate) handshake_error: Option<HubError>,
    pub(crate) stopping: bool,
    pub(crate) stop_error: Option<String>,
    pub(crate) next_server_timeout: Instant,
    pub(crate) next_ping: Instant,
    pub(crate) workers: Option<WorkerPool>,
    outbound: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
}

impl ConnectionState {
    pub(crate) fn new(attempt: u64, runtime: Handle) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        Self {
            attempt,
            runtime,
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            start: None,
            transport: None,
            transport_kind: None,
            connection_id: None,
            tracker: InvocationTracker::default(),
            handshake: None,
            handshake_received: false,
            handshake_error: None,
            stopping: false,
            stop_error: None,
            next_server_timeout: now,
            next_ping: now,
            workers: None,
            outbound,
            outbound_rx: Some(outbound_rx),
        }
    }

    /// Receiver for the writer task; available once.
    pub(crate) fn take_outbound(&mut self) -> Option<mpsc::UnboundedReceiver<Outbound>> {
        self.outbound_rx.take()
    }

    /// Queue `payload` for the transport and push the ping deadline back.
    ///
    /// Returns `false` once the writer has gone away.
    pub(crate) fn enqueue(&mut self, payload: Bytes, ack: Option<Ack>, keep_alive: Duration) -> bool {
        self.next_ping = Instant::now() + keep_alive;
        self.outbound.send(Outbound { payload, ack }).is_ok()
    }

    pub(crate) fn reset_server_timeout(&mut self, timeout: Duration) {
        self.next_server_timeout = Instant::now() + timeout;
    }

    /// Fail the pending `start` with `error`, or keep it for the waiter
    /// registered later.
    pub(crate) fn fail_handshake(&mut self, error: HubError) {
        match self.handshake.take() {
            Some(waiter) => {
                let _ = waiter.send(Err(error));
            }
            None => self.handshake_error = Some(error),
        }
    }
}
