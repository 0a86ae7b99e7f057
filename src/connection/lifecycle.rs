//! Starting and stopping a connection attempt.
//!
//! `start` runs on its own task so concurrent callers can share its outcome.
//! Each stage re-checks that its attempt is still current and not stopping;
//! a stop always wins and the start fails with a stage-specific
//! `ConnectionClosed` error.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Weak, atomic::Ordering},
};

use futures::FutureExt;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use super::{
    Inner,
    config::CLOSE_FLUSH_TIMEOUT,
    state::{ConnectionState, HubConnectionState, Outbound, Shared},
};
use crate::{
    error::{HandshakeError, HubError, NegotiateError},
    metrics::{self, Direction},
    negotiate::{NegotiateOutcome, Negotiation},
    panic::CallbackPanic,
    protocol::handshake::HandshakeRequest,
    transport::{LongPollingTransport, Transport, TransportKind, WebSocketTransport},
};

/// Await `future` unless `shutdown` fires first.
async fn until_cancelled<T>(
    shutdown: &CancellationToken,
    stage: &str,
    future: impl Future<Output = T>,
) -> Result<T, HubError> {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => Err(HubError::closed_while(stage)),
        value = future => Ok(value),
    }
}

/// What the caller of `stop` has to do once the lock is released.
struct StopPlan {
    attempt: u64,
    /// `false` when another stop is already tearing this attempt down.
    first: bool,
    transport: Option<Arc<dyn Transport>>,
    shutdown: CancellationToken,
    finished: CancellationToken,
    close_ack: Option<oneshot::Receiver<Result<(), HubError>>>,
}

impl Inner {
    pub(super) async fn start(self: Arc<Self>) -> Result<(), HubError> {
        let start = {
            let mut shared = self.lock();
            if shared.state == HubConnectionState::Disconnected {
                let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed) + 1;
                let mut cs = ConnectionState::new(attempt, Handle::current());
                let task = tokio::spawn(Arc::clone(&self).run_start(attempt, cs.shutdown.clone()));
                let start = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(HubError::ConnectionClosed(format!("start task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                cs.start = Some(start.clone());
                shared.current = Some(cs);
                shared.state = HubConnectionState::Connecting;
                tracing::debug!(attempt, url = %shared.base_url, "starting HubConnection");
                start
            } else {
                match shared.current.as_ref().and_then(|cs| cs.start.clone()) {
                    Some(start) => start,
                    None => return Ok(()),
                }
            }
        };
        start.await
    }

    async fn run_start(
        self: Arc<Self>,
        attempt: u64,
        shutdown: CancellationToken,
    ) -> Result<(), HubError> {
        let result = self.connect(attempt, &shutdown).await;
        if let Err(e) = &result {
            metrics::inc_errors();
            tracing::error!(error = %e, "HubConnection failed to start");
            self.abandon_start(attempt, e).await;
        }
        result
    }

    async fn connect(
        self: &Arc<Self>,
        attempt: u64,
        shutdown: &CancellationToken,
    ) -> Result<(), HubError> {
        let base_url = self.lock().base_url.clone();
        let mut headers = self.config.headers.clone();
        if let Some(provider) = &self.access_token {
            let token = until_cancelled(shutdown, "trying to connect", provider())
                .await?
                .map_err(|e| HubError::AccessToken(e.to_string()))?;
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                headers.insert("Authorization".into(), format!("Bearer {token}"));
            }
        }

        let negotiated = if self.config.skip_negotiation {
            if self.custom_transport.is_none() && self.config.transport != TransportKind::WebSockets {
                return Err(NegotiateError::SkipRequiresWebSockets.into());
            }
            NegotiateOutcome {
                url: base_url,
                transport: TransportKind::WebSockets,
                connection_id: None,
                connection_token: None,
            }
        } else {
            let negotiation = Negotiation {
                http: self.http.as_ref(),
                requested: self.config.transport,
                format: self.protocol.transfer_format(),
                timeout: self.config.negotiate_timeout,
            };
            until_cancelled(shutdown, "trying to connect", negotiation.run(&base_url, &mut headers))
                .await??
        };

        let (transport, kind): (Arc<dyn Transport>, Option<TransportKind>) =
            match &self.custom_transport {
                Some(transport) => (Arc::clone(transport), None),
                None if negotiated.transport == TransportKind::LongPolling => (
                    Arc::new(LongPollingTransport::new(headers, Arc::clone(&self.http))),
                    Some(TransportKind::LongPolling),
                ),
                None => (
                    Arc::new(WebSocketTransport::new(headers, self.protocol.transfer_format())),
                    Some(TransportKind::WebSockets),
                ),
            };
        self.wire(attempt, transport.as_ref());
        {
            let mut shared = self.lock();
            let cs = shared
                .attempt_mut(attempt)
                .filter(|cs| !cs.stopping)
                .ok_or_else(|| HubError::closed_while("trying to connect"))?;
            cs.transport = Some(Arc::clone(&transport));
            cs.transport_kind = kind;
            cs.connection_id = negotiated.connection_id;
        }
        tracing::debug!(transport = ?kind, url = %negotiated.url, "starting transport");
        until_cancelled(shutdown, "trying to connect", transport.start(&negotiated.url)).await??;

        let request = HandshakeRequest {
            protocol: self.protocol.name(),
            version: self.protocol.version(),
        }
        .to_bytes();
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let (ack, acked) = oneshot::channel();
        {
            let mut shared = self.lock();
            let keep_alive = self.config.keep_alive_interval;
            let cs = shared
                .attempt_mut(attempt)
                .filter(|cs| !cs.stopping)
                .ok_or_else(|| HubError::closed_while("sending handshake"))?;
            let queue = cs
                .take_outbound()
                .ok_or_else(|| HubError::closed_while("sending handshake"))?;
            // The transport may deliver the response while starting.
            if let Some(error) = cs.handshake_error.take() {
                let _ = handshake_tx.send(Err(error));
            } else if cs.handshake_received {
                let _ = handshake_tx.send(Ok(()));
            } else {
                cs.handshake = Some(handshake_tx);
            }
            cs.enqueue(request, Some(ack), keep_alive);
            cs.runtime.spawn(write_outbound(
                Arc::downgrade(self),
                attempt,
                Arc::clone(&transport),
                queue,
                cs.shutdown.clone(),
            ));
        }
        until_cancelled(shutdown, "sending handshake", acked)
            .await?
            .unwrap_or_else(|_| Err(HubError::closed_while("sending handshake")))?;
        tracing::debug!("sent handshake request");

        let waited = tokio::time::timeout(
            self.config.handshake_timeout,
            until_cancelled(shutdown, "waiting for handshake", handshake_rx),
        )
        .await;
        match waited {
            Err(_) => return Err(HandshakeError::Timeout.into()),
            Ok(received) => received?
                .unwrap_or_else(|_| Err(HubError::closed_while("waiting for handshake")))?,
        }

        let mut shared = self.lock();
        let connected = shared.state == HubConnectionState::Connected;
        let cs = shared
            .attempt_mut(attempt)
            .filter(|cs| connected && !cs.stopping)
            .ok_or_else(|| HubError::closed_while("waiting for handshake"))?;
        tracing::info!(
            connection_id = ?cs.connection_id,
            transport = ?cs.transport_kind,
            "HubConnection started"
        );
        Ok(())
    }

    /// Route transport callbacks for `attempt` back to the connection.
    fn wire(self: &Arc<Self>, attempt: u64, transport: &dyn Transport) {
        let inner = Arc::downgrade(self);
        transport.set_on_receive(Arc::new(move |payload| {
            if let Some(inner) = inner.upgrade() {
                inner.on_receive(attempt, payload);
            }
        }));
        let inner = Arc::downgrade(self);
        transport.set_on_close(Arc::new(move |error| {
            if let Some(inner) = inner.upgrade() {
                inner.on_transport_closed(attempt, error);
            }
        }));
    }

    /// Undo a failed start. Close callbacks do not run.
    async fn abandon_start(&self, attempt: u64, error: &HubError) {
        let released = {
            let mut shared = self.lock();
            if shared.attempt_mut(attempt).is_some_and(|cs| !cs.stopping) {
                shared.release(attempt)
            } else {
                None
            }
        };
        // A concurrent stop owns the teardown.
        let Some(mut cs) = released else { return };
        cs.shutdown.cancel();
        for request in cs.tracker.drain() {
            request.fail(error.clone());
        }
        if let Some(transport) = cs.transport.take() {
            if let Err(e) = transport.stop().await {
                tracing::debug!(error = %e, "transport stop after failed start");
            }
        }
        cs.finished.cancel();
    }

    pub(super) fn on_transport_closed(self: &Arc<Self>, attempt: u64, error: Option<String>) {
        {
            let mut shared = self.lock();
            let connecting = shared.state == HubConnectionState::Connecting;
            let Some(cs) = shared.attempt_mut(attempt) else { return };
            if connecting && !cs.stopping {
                tracing::debug!(error = ?error, "transport closed while connecting");
                if cs.handshake.is_some() {
                    let cause = error.map_or_else(
                        || HubError::closed_while("waiting for handshake"),
                        HubError::ConnectionClosed,
                    );
                    cs.fail_handshake(cause);
                } else {
                    cs.shutdown.cancel();
                }
                return;
            }
        }
        self.teardown(attempt, error);
    }

    /// Stop the connection, or only `attempt` when given.
    ///
    /// `error` is recorded as the cause reported to pending invocations and
    /// close callbacks; it takes precedence over any error the transport
    /// reports while closing.
    pub(super) async fn stop_with(
        self: &Arc<Self>,
        attempt: Option<u64>,
        error: Option<String>,
    ) -> Result<(), HubError> {
        let plan = {
            let mut shared = self.lock();
            self.plan_stop(&mut shared, attempt, error, true)
        };
        if let Some(plan) = plan {
            self.carry_out(plan).await;
        }
        Ok(())
    }

    /// Stop `attempt` from a context that cannot await.
    ///
    /// The stop is recorded before returning, so a transport close that
    /// follows reports `error` rather than its own cause. No `Close` message
    /// is sent.
    pub(super) fn spawn_stop(self: &Arc<Self>, attempt: u64, error: Option<String>) {
        let (plan, runtime) = {
            let mut shared = self.lock();
            let Some(runtime) = shared.attempt_mut(attempt).map(|cs| cs.runtime.clone()) else {
                return;
            };
            (self.plan_stop(&mut shared, Some(attempt), error, false), runtime)
        };
        let Some(plan) = plan.filter(|plan| plan.first) else { return };
        let inner = Arc::clone(self);
        runtime.spawn(async move { inner.carry_out(plan).await });
    }

    async fn carry_out(self: &Arc<Self>, plan: StopPlan) {
        if plan.first {
            if let Some(ack) = plan.close_ack {
                // Best effort; the transport is stopped regardless.
                let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, ack).await;
            }
            plan.shutdown.cancel();
            if let Some(transport) = plan.transport {
                if let Err(e) = transport.stop().await {
                    tracing::warn!(error = %e, "transport failed to stop cleanly");
                }
            }
            self.teardown(plan.attempt, None);
        }
        plan.finished.cancelled().await;
    }

    fn plan_stop(
        &self,
        shared: &mut Shared,
        attempt: Option<u64>,
        error: Option<String>,
        announce: bool,
    ) -> Option<StopPlan> {
        if shared.state == HubConnectionState::Disconnected {
            return None;
        }
        let connected = shared.state == HubConnectionState::Connected;
        let keep_alive = self.config.keep_alive_interval;
        let cs = shared
            .current
            .as_mut()
            .filter(|cs| attempt.is_none_or(|a| a == cs.attempt))?;
        let first = !cs.stopping;
        let mut close_ack = None;
        if first {
            cs.stopping = true;
            match &error {
                Some(e) => {
                    tracing::error!(error = %e, "HubConnection stopping with an error");
                    cs.stop_error = Some(e.clone());
                }
                None => {
                    tracing::info!("stopping HubConnection");
                    if connected && announce {
                        let (ack, acked) = oneshot::channel();
                        if cs.enqueue(self.close.clone(), Some(ack), keep_alive) {
                            close_ack = Some(acked);
                        }
                    }
                }
            }
        }
        Some(StopPlan {
            attempt: cs.attempt,
            first,
            transport: cs.transport.clone(),
            shutdown: cs.shutdown.clone(),
            finished: cs.finished.clone(),
            close_ack,
        })
    }

    /// Release `attempt`, resolve its invocations and notify observers.
    ///
    /// Runs once per attempt; later calls find nothing to release.
    fn teardown(&self, attempt: u64, transport_error: Option<String>) {
        let (mut cs, was_connected) = {
            let mut shared = self.lock();
            let was_connected = shared.state == HubConnectionState::Connected;
            let Some(cs) = shared.release(attempt) else { return };
            (cs, was_connected)
        };
        cs.shutdown.cancel();
        let cause = cs
            .stop_error
            .take()
            .or(transport_error)
            .map(HubError::ConnectionClosed);
        for request in cs.tracker.drain() {
            request.fail(cause.clone().unwrap_or(HubError::Canceled));
        }
        if was_connected {
            metrics::dec_connections();
        }
        match &cause {
            Some(e) => tracing::error!(error = %e, "HubConnection disconnected with an error"),
            None => tracing::info!("HubConnection stopped"),
        }
        for callback in self.closed_callbacks() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(cause.as_ref()))) {
                tracing::error!(panic = %CallbackPanic::new(panic), "invoking onClosed callback failed");
            }
        }
        cs.finished.cancel();
    }
}

/// Drain queued payloads into the transport, in order.
async fn write_outbound(
    inner: Weak<Inner>,
    attempt: u64,
    transport: Arc<dyn Transport>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => None,
            next = queue.recv() => next,
        };
        let Some(Outbound { payload, ack }) = next else { break };
        let result = transport.send(payload).await.map_err(HubError::from);
        let failure = match &result {
            Ok(()) => {
                metrics::inc_messages(Direction::Outbound, 1);
                None
            }
            Err(e) => {
                metrics::inc_errors();
                tracing::warn!(error = %e, "failed to send payload");
                Some(e.to_string())
            }
        };
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        if let Some(error) = failure {
            // During the handshake the acknowledgement fails the start.
            if let Some(inner) = inner.upgrade() {
                let connected = inner.lock().state == HubConnectionState::Connected;
                if connected {
                    let _ = inner.stop_with(Some(attempt), Some(error)).await;
                }
            }
            break;
        }
    }
}
