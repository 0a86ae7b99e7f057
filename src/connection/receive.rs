//! Inbound payloads: handshake completion and message routing.

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;

use super::{
    Inner,
    dispatch::{self, HandlerOutcome, Job, WorkerPool},
    keep_alive,
    state::{HubConnectionState, Shared},
};
use crate::{
    binder::InvocationBinder,
    handlers::HandlerAction,
    message::{CompletionMessage, HubMessage, InvocationMessage, StreamItemMessage},
    metrics::{self, Direction},
    protocol::handshake,
    transport::TransportKind,
    value::Shape,
};

pub(crate) const NO_RESULT: &str = "Client did not provide a result.";
pub(crate) const ARGUMENT_BINDING_FAILED: &str = "Client failed to parse argument(s).";

/// Shapes for decoding, taken from handlers and pending invocations.
struct ConnectionBinder<'a> {
    inner: &'a Inner,
    attempt: u64,
}

impl InvocationBinder for ConnectionBinder<'_> {
    fn parameter_shapes(&self, target: &str) -> Option<Vec<Shape>> {
        self.inner.handlers.parameter_shapes(target)
    }

    fn result_shape(&self, invocation_id: &str) -> Option<Shape> {
        let mut shared = self.inner.lock();
        shared
            .attempt_mut(self.attempt)
            .and_then(|cs| cs.tracker.get(invocation_id))
            .map(|request| request.result_shape().clone())
    }
}

impl Inner {
    pub(super) fn on_receive(self: &Arc<Self>, attempt: u64, payload: Bytes) {
        let offset = {
            let mut shared = self.lock();
            let server_timeout = self.config.server_timeout;
            let Some(cs) = shared.attempt_mut(attempt) else {
                tracing::debug!(attempt, "dropping payload for a closed connection");
                return;
            };
            cs.reset_server_timeout(server_timeout);
            if cs.handshake_received {
                0
            } else {
                match self.accept_handshake(&mut shared, attempt, &payload) {
                    Some(offset) => offset,
                    None => return,
                }
            }
        };
        if offset >= payload.len() {
            return;
        }
        let payload = payload.slice(offset..);
        let binder = ConnectionBinder {
            inner: self,
            attempt,
        };
        let messages = match self.protocol.parse_messages(&payload, &binder) {
            Ok(messages) => messages,
            Err(e) => {
                metrics::inc_errors();
                tracing::error!(error = %e, "failed to parse inbound messages");
                self.spawn_stop(attempt, Some(e.to_string()));
                return;
            }
        };
        metrics::inc_messages(Direction::Inbound, messages.len());
        for message in messages {
            self.route(attempt, message);
        }
    }

    /// Parse the handshake response at the front of `payload`.
    ///
    /// Returns the offset of the first regular message, or `None` if the
    /// handshake failed or the attempt is being stopped.
    fn accept_handshake(
        self: &Arc<Self>,
        shared: &mut Shared,
        attempt: u64,
        payload: &[u8],
    ) -> Option<usize> {
        let parsed = handshake::parse_response(payload).and_then(|(response, rest)| {
            response.into_result().map(|()| payload.len() - rest.len())
        });
        let connecting = shared.state == HubConnectionState::Connecting;
        let cs = shared.attempt_mut(attempt)?;
        let offset = match parsed {
            Ok(offset) => offset,
            Err(e) => {
                tracing::error!(error = %e, "handshake failed");
                cs.fail_handshake(e.into());
                return None;
            }
        };
        if cs.stopping || !connecting {
            return None;
        }
        tracing::debug!("handshake response received");
        cs.handshake_received = true;
        cs.reset_server_timeout(self.config.server_timeout);
        cs.workers = Some(WorkerPool::spawn(
            &cs.runtime,
            self.config.handler_workers,
            &cs.shutdown,
        ));
        if cs.transport_kind != Some(TransportKind::LongPolling) {
            keep_alive::spawn(
                Arc::downgrade(self),
                attempt,
                &cs.runtime,
                cs.shutdown.clone(),
                self.config.tick_rate,
            );
        }
        let waiter = cs.handshake.take();
        shared.state = HubConnectionState::Connected;
        metrics::inc_connections();
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
        Some(offset)
    }

    fn route(self: &Arc<Self>, attempt: u64, message: HubMessage) {
        tracing::debug!(message_type = ?message.message_type(), "received message");
        match message {
            HubMessage::InvocationBindingFailure(failure) => {
                metrics::inc_errors();
                tracing::error!(
                    invocation_id = ?failure.invocation_id,
                    method = %failure.target,
                    error = %failure.cause,
                    "failed to bind invocation arguments"
                );
                if let Some(id) = failure.invocation_id {
                    self.reply(attempt, CompletionMessage::with_error(id, ARGUMENT_BINDING_FAILED));
                }
            }
            HubMessage::Invocation(invocation) => self.dispatch_invocation(attempt, invocation),
            HubMessage::Close(close) => {
                tracing::info!(error = ?close.error, "close message received from server");
                self.spawn_stop(attempt, close.error);
            }
            HubMessage::Ping => {}
            HubMessage::Completion(completion) => {
                let request = self
                    .lock()
                    .attempt_mut(attempt)
                    .and_then(|cs| cs.tracker.remove(completion.invocation_id()));
                match request {
                    Some(request) => request.complete(completion),
                    None => tracing::warn!(
                        invocation_id = %completion.invocation_id(),
                        "dropped unsolicited completion message"
                    ),
                }
            }
            HubMessage::StreamItem(StreamItemMessage {
                invocation_id,
                item,
                ..
            }) => {
                let delivered = self
                    .lock()
                    .attempt_mut(attempt)
                    .and_then(|cs| cs.tracker.get(&invocation_id))
                    .map(|request| request.add_item(item));
                match delivered {
                    Some(true) => {}
                    Some(false) => tracing::warn!(
                        invocation_id = %invocation_id,
                        "dropped stream item for a non-streaming invocation"
                    ),
                    None => tracing::warn!(
                        invocation_id = %invocation_id,
                        "dropped unsolicited stream item message"
                    ),
                }
            }
            other @ (HubMessage::StreamInvocation(_) | HubMessage::CancelInvocation(_)) => {
                tracing::warn!(
                    message_type = ?other.message_type(),
                    "client does not accept this message type; dropped"
                );
            }
        }
    }

    fn dispatch_invocation(self: &Arc<Self>, attempt: u64, invocation: InvocationMessage) {
        let InvocationMessage {
            invocation_id,
            target,
            arguments,
            ..
        } = invocation;
        let Some(handlers) = self.handlers.get(&target) else {
            match invocation_id {
                Some(id) => {
                    tracing::warn!(method = %target, "no result handler registered; sending error");
                    self.reply(attempt, CompletionMessage::with_error(id, NO_RESULT));
                }
                None => tracing::warn!(method = %target, "no handler registered"),
            }
            return;
        };
        let mut result_handler = None;
        for handler in &handlers {
            match handler.action() {
                HandlerAction::Action(action) => dispatch::run_action(&target, action, arguments.clone()),
                HandlerAction::Result(produce) => result_handler = Some(Arc::clone(produce)),
            }
        }
        let Some(produce) = result_handler else {
            if let Some(id) = invocation_id {
                tracing::warn!(method = %target, "no result handler registered; sending error");
                self.reply(attempt, CompletionMessage::with_error(id, NO_RESULT));
            }
            return;
        };
        let inner = Arc::downgrade(self);
        let job: Job = async move {
            let outcome = dispatch::run_result(&target, &produce, arguments).await;
            if let Some(inner) = inner.upgrade() {
                inner.answer(attempt, &target, invocation_id, outcome);
            }
        }
        .boxed();
        let queued = self
            .lock()
            .attempt_mut(attempt)
            .and_then(|cs| cs.workers.as_ref().map(|workers| workers.submit(job)));
        if queued != Some(true) {
            tracing::debug!("connection closing; invocation dropped");
        }
    }

    fn answer(
        &self,
        attempt: u64,
        target: &str,
        invocation_id: Option<String>,
        outcome: HandlerOutcome,
    ) {
        match (invocation_id, outcome) {
            (Some(id), HandlerOutcome::Value(value)) => {
                self.reply(attempt, CompletionMessage::with_result(id, value));
            }
            (Some(id), HandlerOutcome::Failed(error)) => {
                self.reply(attempt, CompletionMessage::with_error(id, error));
            }
            (None, HandlerOutcome::Value(_)) => tracing::warn!(
                method = %target,
                "result given for method but server is not expecting a result"
            ),
            (None, HandlerOutcome::Failed(_)) => {}
        }
    }

    fn reply(&self, attempt: u64, completion: CompletionMessage) {
        let id = completion.invocation_id().to_owned();
        if let Err(e) = self.transmit("send", attempt, &HubMessage::Completion(completion), None) {
            tracing::debug!(invocation_id = %id, error = %e, "could not send completion");
        }
    }
}
