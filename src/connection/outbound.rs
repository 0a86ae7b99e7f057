//! Client-initiated invocations and upload streams.
//!
//! Ids are allocated and pending invocations registered under the lock, so
//! a reply can never arrive before the tracker expects it. The message is
//! encoded after the lock is released and then queued for the writer; upload
//! streams start only once their invocation is queued.

use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, StreamExt};
use tokio::sync::oneshot;

use super::{
    Inner,
    state::{Ack, ConnectionState},
};
use crate::{
    error::HubError,
    invocation::InvocationRequest,
    message::{
        CancelInvocationMessage,
        CompletionMessage,
        HubMessage,
        InvocationMessage,
        StreamInvocationMessage,
        StreamItemMessage,
    },
    panic::CallbackPanic,
    stream::{HubArgument, HubStream, UploadSource, split_uploads},
    value::{Shape, Value},
};

/// Arguments of one outgoing call after upload sources were split off.
struct OutgoingCall {
    attempt: u64,
    arguments: Vec<Value>,
    uploads: Vec<(String, UploadSource)>,
}

impl OutgoingCall {
    /// Allocate upload ids from the attempt's shared counter.
    fn allocate(cs: &mut ConnectionState, arguments: Vec<HubArgument>) -> Self {
        let (arguments, uploads) = split_uploads(arguments, || cs.tracker.next_id());
        Self {
            attempt: cs.attempt,
            arguments,
            uploads,
        }
    }

    fn stream_ids(&self) -> Option<Vec<String>> {
        (!self.uploads.is_empty()).then(|| self.uploads.iter().map(|(id, _)| id.clone()).collect())
    }
}

impl Inner {
    pub(super) async fn send(
        self: &Arc<Self>,
        target: &str,
        arguments: Vec<HubArgument>,
    ) -> Result<(), HubError> {
        let call = {
            let mut shared = self.lock();
            let cs = shared.connected_mut().ok_or_else(|| HubError::inactive("send"))?;
            OutgoingCall::allocate(cs, arguments)
        };
        let message = HubMessage::Invocation(InvocationMessage {
            headers: None,
            invocation_id: None,
            target: target.to_owned(),
            stream_ids: call.stream_ids(),
            arguments: call.arguments,
        });
        let (ack, acked) = oneshot::channel();
        self.transmit("send", call.attempt, &message, Some(ack))?;
        self.launch_uploads(call.attempt, call.uploads);
        acked
            .await
            .unwrap_or_else(|_| Err(HubError::closed_while("sending the message")))
    }

    pub(super) async fn invoke(
        self: &Arc<Self>,
        target: &str,
        arguments: Vec<HubArgument>,
        result_shape: Shape,
    ) -> Result<Value, HubError> {
        let (tx, rx) = oneshot::channel();
        let (id, call) = {
            let mut shared = self.lock();
            let cs = shared.connected_mut().ok_or_else(|| HubError::inactive("invoke"))?;
            let id = cs.tracker.next_id();
            let call = OutgoingCall::allocate(cs, arguments);
            cs.tracker
                .add(id.clone(), InvocationRequest::single(result_shape, tx))?;
            (id, call)
        };
        let message = HubMessage::Invocation(InvocationMessage {
            headers: None,
            invocation_id: Some(id.clone()),
            target: target.to_owned(),
            stream_ids: call.stream_ids(),
            arguments: call.arguments,
        });
        if let Err(e) = self.transmit("invoke", call.attempt, &message, None) {
            self.forget(call.attempt, &id, &e);
            return Err(e);
        }
        self.launch_uploads(call.attempt, call.uploads);
        match rx.await {
            Ok(outcome) => outcome.map(Option::unwrap_or_default),
            Err(_) => Err(HubError::Canceled),
        }
    }

    pub(super) async fn stream(
        self: &Arc<Self>,
        target: &str,
        arguments: Vec<HubArgument>,
        item_shape: Shape,
    ) -> Result<HubStream, HubError> {
        let (id, call, stream, registered) = {
            let mut shared = self.lock();
            let cs = shared.connected_mut().ok_or_else(|| HubError::inactive("stream"))?;
            let id = cs.tracker.next_id();
            let call = OutgoingCall::allocate(cs, arguments);
            let inner = Arc::downgrade(self);
            let attempt = cs.attempt;
            let cancel_id = id.clone();
            let (stream, sink) = HubStream::new(id.clone(), move || {
                if let Some(inner) = inner.upgrade() {
                    inner.cancel_stream(attempt, &cancel_id);
                }
            });
            let registered = cs
                .tracker
                .add(id.clone(), InvocationRequest::stream(item_shape, sink));
            (id, call, stream, registered)
        };
        // The stream is dropped, and may cancel, only after the lock is released.
        registered?;
        let message = HubMessage::StreamInvocation(StreamInvocationMessage {
            headers: None,
            invocation_id: id.clone(),
            target: target.to_owned(),
            stream_ids: call.stream_ids(),
            arguments: call.arguments,
        });
        if let Err(e) = self.transmit("stream", call.attempt, &message, None) {
            self.forget(call.attempt, &id, &e);
            return Err(e);
        }
        self.launch_uploads(call.attempt, call.uploads);
        Ok(stream)
    }

    /// Encode `message` and queue it for `attempt`.
    ///
    /// Fails with a usage error naming `method` if the attempt is no longer
    /// connected.
    pub(super) fn transmit(
        &self,
        method: &str,
        attempt: u64,
        message: &HubMessage,
        ack: Option<Ack>,
    ) -> Result<(), HubError> {
        let payload = self.encode(message)?;
        let keep_alive = self.config.keep_alive_interval;
        let mut shared = self.lock();
        match shared.connected_mut().filter(|cs| cs.attempt == attempt) {
            Some(cs) => {
                if cs.enqueue(payload, ack, keep_alive) {
                    Ok(())
                } else {
                    Err(HubError::inactive(method))
                }
            }
            _ => Err(HubError::inactive(method)),
        }
    }

    /// Resolve a tracked invocation that never reached the writer.
    fn forget(&self, attempt: u64, invocation_id: &str, error: &HubError) {
        let request = self
            .lock()
            .attempt_mut(attempt)
            .and_then(|cs| cs.tracker.remove(invocation_id));
        if let Some(request) = request {
            request.fail(error.clone());
        }
    }

    /// Every subscriber of a download went away.
    fn cancel_stream(&self, attempt: u64, invocation_id: &str) {
        let removed = self
            .lock()
            .attempt_mut(attempt)
            .and_then(|cs| cs.tracker.remove(invocation_id));
        if removed.is_none() {
            return;
        }
        tracing::debug!(invocation_id = %invocation_id, "cancelling stream invocation");
        let message = HubMessage::CancelInvocation(CancelInvocationMessage {
            headers: None,
            invocation_id: invocation_id.to_owned(),
        });
        if let Err(e) = self.transmit("stream", attempt, &message, None) {
            tracing::debug!(invocation_id = %invocation_id, error = %e, "could not send cancellation");
        }
    }

    /// Drain each upload source into stream items and a final completion.
    fn launch_uploads(self: &Arc<Self>, attempt: u64, uploads: Vec<(String, UploadSource)>) {
        if uploads.is_empty() {
            return;
        }
        let Some((runtime, shutdown)) = self
            .lock()
            .attempt_mut(attempt)
            .map(|cs| (cs.runtime.clone(), cs.shutdown.clone()))
        else {
            return;
        };
        for (id, source) in uploads {
            let inner = Arc::downgrade(self);
            let shutdown = shutdown.clone();
            runtime.spawn(async move {
                // Subscribing happens on the first poll, under `catch_unwind`.
                let mut items = futures::stream::once(async move { source.subscribe() })
                    .flatten()
                    .boxed();
                let completion = loop {
                    let next = tokio::select! {
                        biased;
                        () = shutdown.cancelled() => return,
                        next = AssertUnwindSafe(items.next()).catch_unwind() => next,
                    };
                    let Some(inner) = inner.upgrade() else { return };
                    let next = match next {
                        Ok(next) => next,
                        Err(panic) => {
                            let panic = CallbackPanic::new(panic);
                            tracing::error!(invocation_id = %id, panic = %panic, "upload source panicked");
                            break CompletionMessage::with_error(id.clone(), panic.to_string());
                        }
                    };
                    match next {
                        Some(Ok(item)) => {
                            let message = HubMessage::StreamItem(StreamItemMessage {
                                headers: None,
                                invocation_id: id.clone(),
                                item,
                            });
                            if inner.transmit("stream", attempt, &message, None).is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => break CompletionMessage::with_error(id.clone(), e.to_string()),
                        None => break CompletionMessage::void(id.clone()),
                    }
                };
                tracing::debug!(invocation_id = %id, "upload stream finished");
                if let Some(inner) = inner.upgrade() {
                    let _ = inner.transmit("stream", attempt, &HubMessage::Completion(completion), None);
                }
            });
        }
    }
}
