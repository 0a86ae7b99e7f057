//! Registry of client-side handlers for server invocations.
//!
//! `CallbackMap` outlives individual connection attempts and may be
//! modified while the connection is running. Targets match
//! case-insensitively. Each target may have any number of plain handlers but
//! at most one handler that produces a result.

use std::sync::{
    Arc,
    Weak,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::{
    error::HubError,
    stream::BoxError,
    value::{Shape, Value},
};

/// Handler that returns nothing.
pub type ActionHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Handler whose result is sent back to the server.
pub type ResultHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum HandlerAction {
    Action(ActionHandler),
    Result(ResultHandler),
}

/// One registered handler and the argument shapes it binds, if declared.
pub(crate) struct InvocationHandler {
    id: u64,
    shapes: Option<Vec<Shape>>,
    action: HandlerAction,
}

impl InvocationHandler {
    pub(crate) fn action(&self) -> &HandlerAction { &self.action }

    pub(crate) fn has_result(&self) -> bool { matches!(self.action, HandlerAction::Result(_)) }
}

/// Concurrent map of target name to handlers.
#[derive(Default)]
pub(crate) struct CallbackMap {
    handlers: DashMap<String, Vec<Arc<InvocationHandler>>>,
    next_id: AtomicU64,
}

impl CallbackMap {
    /// Register a handler for `target`.
    ///
    /// Fails if `action` produces a result and `target` already has a
    /// result-producing handler.
    pub(crate) fn put(
        self: &Arc<Self>,
        target: &str,
        shapes: Option<Vec<Shape>>,
        action: HandlerAction,
    ) -> Result<Subscription, HubError> {
        let handler = self.handler(shapes, action);
        let mut entry = self.handlers.entry(key(target)).or_default();
        if handler.has_result() && entry.iter().any(|h| h.has_result()) {
            return Err(HubError::Usage(format!(
                "'{target}' already has a value returning handler. Multiple return values are \
                 not supported."
            )));
        }
        let handler_id = handler.id;
        entry.push(handler);
        drop(entry);
        Ok(self.subscription(target, handler_id))
    }

    /// Register a handler that produces no result; never rejected.
    pub(crate) fn put_action(
        self: &Arc<Self>,
        target: &str,
        shapes: Option<Vec<Shape>>,
        action: ActionHandler,
    ) -> Subscription {
        let handler = self.handler(shapes, HandlerAction::Action(action));
        let handler_id = handler.id;
        self.handlers.entry(key(target)).or_default().push(handler);
        self.subscription(target, handler_id)
    }

    fn handler(&self, shapes: Option<Vec<Shape>>, action: HandlerAction) -> Arc<InvocationHandler> {
        Arc::new(InvocationHandler {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            shapes,
            action,
        })
    }

    fn subscription(self: &Arc<Self>, target: &str, handler_id: u64) -> Subscription {
        Subscription {
            map: Arc::downgrade(self),
            target: key(target),
            handler_id,
        }
    }

    /// Snapshot of the handlers for `target`.
    pub(crate) fn get(&self, target: &str) -> Option<Vec<Arc<InvocationHandler>>> {
        self.handlers
            .get(&key(target))
            .map(|entry| entry.value().clone())
            .filter(|handlers| !handlers.is_empty())
    }

    /// Argument shapes declared by the first handler of `target`.
    ///
    /// `None` when there is no handler or it accepts untyped arguments.
    pub(crate) fn parameter_shapes(&self, target: &str) -> Option<Vec<Shape>> {
        self.handlers
            .get(&key(target))
            .and_then(|entry| entry.first().and_then(|h| h.shapes.clone()))
    }

    pub(crate) fn remove(&self, target: &str) { self.handlers.remove(&key(target)); }

    fn remove_handler(&self, target: &str, handler_id: u64) {
        if let Some(mut handlers) = self.handlers.get_mut(target) {
            handlers.retain(|h| h.id != handler_id);
        }
        self.handlers.remove_if(target, |_, handlers| handlers.is_empty());
    }
}

fn key(target: &str) -> String { target.to_lowercase() }

/// Registration returned by `on` and `on_with_result`.
///
/// Dropping a subscription keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Clone)]
#[must_use = "keep the subscription to unsubscribe the handler later"]
pub struct Subscription {
    map: Weak<CallbackMap>,
    target: String,
    handler_id: u64,
}

impl Subscription {
    /// Remove this handler; other handlers for the target are kept.
    pub fn unsubscribe(&self) {
        if let Some(map) = self.map.upgrade() {
            map.remove_handler(&self.target, self.handler_id);
        }
    }

    /// The target, lowercased.
    #[must_use]
    pub fn target(&self) -> &str { &self.target }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("target", &self.target)
            .field("handler_id", &self.handler_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn action() -> HandlerAction { HandlerAction::Action(Arc::new(|_| {})) }

    fn result() -> HandlerAction {
        HandlerAction::Result(Arc::new(|_| async { Ok(Value::Nil) }.boxed()))
    }

    #[test]
    fn second_result_handler_is_rejected() {
        let map = Arc::new(CallbackMap::default());
        let _plain = map.put("add", None, action()).expect("plain handler");
        let _result = map.put("add", None, result()).expect("first result handler");
        let err = map.put("add", None, result()).expect_err("duplicate result handler");
        assert!(matches!(err, HubError::Usage(_)));
        assert_eq!(map.get("add").map(|h| h.len()), Some(2));
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let map = Arc::new(CallbackMap::default());
        let first = map.put("t", Some(vec![Shape::Int]), action()).expect("register");
        let _second = map.put("t", Some(vec![Shape::String]), action()).expect("register");
        first.unsubscribe();
        let handlers = map.get("t").expect("one handler left");
        assert_eq!(handlers.len(), 1);
        assert_eq!(map.parameter_shapes("t"), Some(vec![Shape::String]));
    }

    #[test]
    fn remove_drops_all_handlers() {
        let map = Arc::new(CallbackMap::default());
        let sub = map.put("t", Some(vec![Shape::Int]), action()).expect("register");
        map.remove("t");
        assert!(map.get("t").is_none());
        assert!(map.parameter_shapes("t").is_none());
        sub.unsubscribe();
    }

    #[test]
    fn targets_match_regardless_of_case() {
        let map = Arc::new(CallbackMap::default());
        let sub = map.put("SendMessage", Some(vec![Shape::Int]), action()).expect("register");
        assert_eq!(sub.target(), "sendmessage");
        assert_eq!(map.get("SENDMESSAGE").map(|h| h.len()), Some(1));
        assert_eq!(map.parameter_shapes("sendMessage"), Some(vec![Shape::Int]));
        map.remove("SendMESSAGE");
        assert!(map.get("sendmessage").is_none());
    }
}
