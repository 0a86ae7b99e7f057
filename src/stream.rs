//! Streaming in both directions.
//!
//! Uploads: an [`UploadSource`] passed as an argument is removed from the
//! positional arguments, given its own invocation id, and drained into
//! `StreamItem` messages followed by a `Completion`.
//!
//! Downloads: [`HubStream`] yields the items of a server stream. Every
//! handle obtained through [`HubStream::subscribe`] receives the items that
//! arrive while it is alive. Dropping the last handle cancels the stream on
//! the server.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

use futures::{Stream, StreamExt, stream::BoxStream};

use crate::{error::HubError, value::Value};

/// Boxed error produced by upload sources and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type SourceFactory = dyn Fn() -> BoxStream<'static, Result<Value, BoxError>> + Send + Sync;

/// A client-to-server stream argument.
///
/// The source is a factory so the same value can be used in several calls;
/// each use subscribes afresh under its own stream id.
#[derive(Clone)]
pub struct UploadSource {
    factory: Arc<SourceFactory>,
}

impl UploadSource {
    /// Wrap a factory producing the stream to upload.
    pub fn new<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            factory: Arc::new(move || factory().boxed()),
        }
    }

    /// Upload a fixed list of items.
    #[must_use]
    pub fn from_items(items: Vec<Value>) -> Self {
        Self::new(move || futures::stream::iter(items.clone().into_iter().map(Ok)))
    }

    pub(crate) fn subscribe(&self) -> BoxStream<'static, Result<Value, BoxError>> {
        (self.factory)()
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSource").finish_non_exhaustive()
    }
}

/// One positional argument of `send`, `invoke` or `stream`.
#[derive(Debug, Clone)]
pub enum HubArgument {
    Value(Value),
    Stream(UploadSource),
}

impl From<Value> for HubArgument {
    fn from(value: Value) -> Self { HubArgument::Value(value) }
}

impl From<UploadSource> for HubArgument {
    fn from(source: UploadSource) -> Self { HubArgument::Stream(source) }
}

macro_rules! impl_argument_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for HubArgument {
            fn from(value: $ty) -> Self { HubArgument::Value(Value::from(value)) }
        })*
    };
}

impl_argument_from!(&str, String, bool, i32, i64, u32, f64, Vec<Value>);

/// Separate upload sources from plain arguments.
///
/// `next_id` is called once per source, in argument order.
pub(crate) fn split_uploads(
    arguments: Vec<HubArgument>,
    mut next_id: impl FnMut() -> String,
) -> (Vec<Value>, Vec<(String, UploadSource)>) {
    let mut values = Vec::with_capacity(arguments.len());
    let mut uploads = Vec::new();
    for argument in arguments {
        match argument {
            HubArgument::Value(value) => values.push(value),
            HubArgument::Stream(source) => uploads.push((next_id(), source)),
        }
    }
    (values, uploads)
}

type Canceller = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Subscriber {
    queue: VecDeque<Result<Value, HubError>>,
    waker: Option<Waker>,
}

#[derive(Default)]
struct ChannelState {
    subscribers: HashMap<u64, Subscriber>,
    next_key: u64,
    terminal: Option<Result<(), HubError>>,
    canceller: Option<Canceller>,
}

impl ChannelState {
    fn wake_all(&mut self) {
        for subscriber in self.subscribers.values_mut() {
            if let Some(waker) = subscriber.waker.take() {
                waker.wake();
            }
        }
    }

    fn add_subscriber(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        let mut subscriber = Subscriber::default();
        if let Some(Err(e)) = &self.terminal {
            subscriber.queue.push_back(Err(e.clone()));
        }
        self.subscribers.insert(key, subscriber);
        key
    }
}

#[derive(Default)]
struct Channel {
    state: Mutex<ChannelState>,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Producer side of a download, held by the invocation tracker.
#[derive(Clone)]
pub(crate) struct StreamSink {
    channel: Arc<Channel>,
}

impl StreamSink {
    /// Deliver an item to every live subscriber.
    pub(crate) fn push(&self, item: &Value) {
        let mut state = self.channel.lock();
        if state.terminal.is_some() {
            return;
        }
        for subscriber in state.subscribers.values_mut() {
            subscriber.queue.push_back(Ok(item.clone()));
        }
        state.wake_all();
    }

    /// End the stream. Only the first call has any effect.
    pub(crate) fn finish(&self, result: Result<(), HubError>) {
        let mut state = self.channel.lock();
        if state.terminal.is_some() {
            return;
        }
        if let Err(e) = &result {
            for subscriber in state.subscribers.values_mut() {
                subscriber.queue.push_back(Err(e.clone()));
            }
        }
        state.terminal = Some(result);
        state.canceller = None;
        state.wake_all();
    }
}

/// A server-to-client stream of items.
///
/// Yields `Ok(item)` for each item, then ends; a server error is yielded
/// once as `Err` before the end.
pub struct HubStream {
    channel: Arc<Channel>,
    key: u64,
    invocation_id: String,
}

impl HubStream {
    /// Create a stream and its producer. `cancel` runs if every handle is
    /// dropped before the stream ends.
    pub(crate) fn new(
        invocation_id: String,
        cancel: impl FnOnce() + Send + 'static,
    ) -> (Self, StreamSink) {
        let channel = Arc::new(Channel::default());
        let key = {
            let mut state = channel.lock();
            state.canceller = Some(Box::new(cancel));
            state.add_subscriber()
        };
        let sink = StreamSink {
            channel: Arc::clone(&channel),
        };
        (
            Self {
                channel,
                key,
                invocation_id,
            },
            sink,
        )
    }

    /// Another handle on the same stream, receiving items from now on.
    #[must_use]
    pub fn subscribe(&self) -> HubStream {
        let key = self.channel.lock().add_subscriber();
        HubStream {
            channel: Arc::clone(&self.channel),
            key,
            invocation_id: self.invocation_id.clone(),
        }
    }

    /// Invocation id the server streams under.
    #[must_use]
    pub fn invocation_id(&self) -> &str { &self.invocation_id }
}

impl Stream for HubStream {
    type Item = Result<Value, HubError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = self.channel.lock();
        let finished = state.terminal.is_some();
        let Some(subscriber) = state.subscribers.get_mut(&self.key) else {
            return Poll::Ready(None);
        };
        if let Some(item) = subscriber.queue.pop_front() {
            return Poll::Ready(Some(item));
        }
        if finished {
            return Poll::Ready(None);
        }
        subscriber.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for HubStream {
    fn drop(&mut self) {
        let canceller = {
            let mut state = self.channel.lock();
            state.subscribers.remove(&self.key);
            if state.subscribers.is_empty() && state.terminal.is_none() {
                state.terminal = Some(Ok(()));
                state.canceller.take()
            } else {
                None
            }
        };
        if let Some(cancel) = canceller {
            tracing::debug!(invocation_id = %self.invocation_id, "last stream subscriber dropped");
            cancel();
        }
    }
}

impl fmt::Debug for HubStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubStream")
            .field("invocation_id", &self.invocation_id)
            .finish_non_exhaustive()
    }
}
