//! Tracking of invocations awaiting a reply from the server.
//!
//! Every pending entry is resolved exactly once: by its completion, by a
//! stream cancellation, or in bulk when the connection tears down.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::{
    error::HubError,
    message::CompletionMessage,
    stream::StreamSink,
    value::{Shape, Value},
};

/// Outcome delivered to a single-result caller.
pub(crate) type InvocationResult = Result<Option<Value>, HubError>;

/// How the caller waits for the reply.
pub(crate) enum PendingCall {
    /// `invoke`: one completion.
    Single(oneshot::Sender<InvocationResult>),
    /// `stream`: items, then one completion.
    Stream(StreamSink),
}

pub(crate) struct InvocationRequest {
    result_shape: Shape,
    call: PendingCall,
}

impl InvocationRequest {
    pub(crate) fn single(result_shape: Shape, sender: oneshot::Sender<InvocationResult>) -> Self {
        Self {
            result_shape,
            call: PendingCall::Single(sender),
        }
    }

    pub(crate) fn stream(item_shape: Shape, sink: StreamSink) -> Self {
        Self {
            result_shape: item_shape,
            call: PendingCall::Stream(sink),
        }
    }

    pub(crate) fn result_shape(&self) -> &Shape { &self.result_shape }

    /// Deliver one stream item; returns `false` if this is not a stream.
    pub(crate) fn add_item(&self, item: Value) -> bool {
        match &self.call {
            PendingCall::Stream(sink) => {
                match self.result_shape.bind(item) {
                    Ok(item) => sink.push(&item),
                    Err(e) => sink.finish(Err(e.into())),
                }
                true
            }
            PendingCall::Single(_) => false,
        }
    }

    /// Resolve with the server's completion.
    ///
    /// A result sent to a stream is not an item and is ignored.
    pub(crate) fn complete(self, completion: CompletionMessage) {
        let (result, error) = completion.into_outcome();
        let error = error.map(HubError::Invocation);
        match self.call {
            PendingCall::Single(sender) => {
                let outcome = match (error, result) {
                    (Some(error), _) => Err(error),
                    (None, Some(result)) => self.result_shape.bind(result).map(Some).map_err(Into::into),
                    (None, None) => Ok(None),
                };
                // The caller may have stopped waiting.
                let _ = sender.send(outcome);
            }
            PendingCall::Stream(sink) => sink.finish(error.map_or(Ok(()), Err)),
        }
    }

    /// Resolve with a failure or cancellation.
    pub(crate) fn fail(self, error: HubError) {
        match self.call {
            PendingCall::Single(sender) => {
                let _ = sender.send(Err(error));
            }
            PendingCall::Stream(sink) => sink.finish(Err(error)),
        }
    }
}

/// Pending invocations and the id counter of one connection attempt.
#[derive(Default)]
pub(crate) struct InvocationTracker {
    next_id: u64,
    pending: HashMap<String, InvocationRequest>,
}

impl InvocationTracker {
    /// Allocate the next invocation id; ids start at "1".
    pub(crate) fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    pub(crate) fn add(&mut self, id: String, request: InvocationRequest) -> Result<(), HubError> {
        if self.pending.contains_key(&id) {
            return Err(HubError::Usage(format!("Invocation id '{id}' is already in use.")));
        }
        self.pending.insert(id, request);
        Ok(())
    }

    pub(crate) fn get(&self, id: &str) -> Option<&InvocationRequest> { self.pending.get(id) }

    pub(crate) fn remove(&mut self, id: &str) -> Option<InvocationRequest> {
        self.pending.remove(id)
    }

    /// Remove every pending invocation for bulk resolution.
    pub(crate) fn drain(&mut self) -> Vec<InvocationRequest> {
        self.pending.drain().map(|(_, request)| request).collect()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::stream::HubStream;

    #[test]
    fn ids_increase_from_one() {
        let mut tracker = InvocationTracker::default();
        assert_eq!(tracker.next_id(), "1");
        assert_eq!(tracker.next_id(), "2");
        assert_eq!(tracker.next_id(), "3");
    }

    #[tokio::test]
    async fn completion_binds_result() {
        let mut tracker = InvocationTracker::default();
        let (tx, rx) = oneshot::channel();
        tracker
            .add("1".into(), InvocationRequest::single(Shape::Float, tx))
            .expect("fresh id");
        let request = tracker.remove("1").expect("tracked");
        request.complete(CompletionMessage::with_result("1", Value::Int(3)));
        assert_eq!(rx.await.expect("resolved"), Ok(Some(Value::Float(3.0))));
        assert!(tracker.remove("1").is_none());
    }

    #[tokio::test]
    async fn completion_result_of_wrong_shape_fails_invocation() {
        let (tx, rx) = oneshot::channel();
        InvocationRequest::single(Shape::Int, tx)
            .complete(CompletionMessage::with_result("1", Value::from("x")));
        assert_eq!(
            rx.await.expect("resolved").expect_err("shape mismatch").to_string(),
            "Cannot bind string to integer."
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut tracker = InvocationTracker::default();
        let (tx, _rx) = oneshot::channel();
        tracker
            .add("1".into(), InvocationRequest::single(Shape::Any, tx))
            .expect("fresh id");
        let (tx, _rx) = oneshot::channel();
        assert!(tracker.add("1".into(), InvocationRequest::single(Shape::Any, tx)).is_err());
    }

    #[tokio::test]
    async fn stream_completion_result_is_not_an_item() {
        let (mut stream, sink) = HubStream::new("1".into(), || {});
        let request = InvocationRequest::stream(Shape::String, sink);
        assert!(request.add_item(Value::from("First")));
        request.complete(CompletionMessage::with_result("1", Value::from("COMPLETED")));
        assert_eq!(stream.next().await, Some(Ok(Value::from("First"))));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn drain_fails_everything_once() {
        let mut tracker = InvocationTracker::default();
        let (tx, rx) = oneshot::channel();
        let id = tracker.next_id();
        tracker
            .add(id, InvocationRequest::single(Shape::Any, tx))
            .expect("fresh id");
        let drained = tracker.drain();
        assert_eq!(drained.len(), 1);
        assert!(tracker.drain().is_empty());
        for request in drained {
            request.fail(HubError::Canceled);
        }
        assert_eq!(rx.await.expect("resolved"), Err(HubError::Canceled));
    }
}
