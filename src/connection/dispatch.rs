//! Execution of client-side handlers.
//!
//! Plain handlers run inline on the receive path, in arrival order.
//! Result-producing handlers run on a per-attempt [`WorkerPool`] so a
//! handler that calls back into the connection cannot stall inbound
//! processing.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use futures::{FutureExt, future::BoxFuture};
use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    handlers::{ActionHandler, ResultHandler},
    panic::CallbackPanic,
    value::Value,
};

pub(crate) type Job = BoxFuture<'static, ()>;

/// Fixed set of tasks draining a shared job queue.
///
/// Workers exit when the attempt's shutdown token fires; a job still
/// running at that point is dropped.
pub(crate) struct WorkerPool {
    jobs: mpsc::UnboundedSender<Job>,
}

impl WorkerPool {
    pub(crate) fn spawn(runtime: &Handle, workers: usize, shutdown: &CancellationToken) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.clone();
            runtime.spawn(async move {
                loop {
                    let job = tokio::select! {
                        biased;
                        () = shutdown.cancelled() => None,
                        job = async { rx.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { break };
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        () = job => {}
                    }
                }
                tracing::trace!(worker, "handler worker exited");
            });
        }
        Self { jobs }
    }

    /// Queue `job`; returns `false` once the workers have exited.
    pub(crate) fn submit(&self, job: Job) -> bool { self.jobs.send(job).is_ok() }
}

/// Run a plain handler, logging instead of propagating a panic.
pub(crate) fn run_action(target: &str, handler: &ActionHandler, arguments: Vec<Value>) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(arguments))) {
        tracing::error!(
            method = %target,
            panic = %CallbackPanic::new(panic),
            "invoking client side method failed"
        );
    }
}

/// What a result handler produced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HandlerOutcome {
    Value(Value),
    /// The handler failed; carries the error text for the server.
    Failed(String),
}

/// Run the result handler for `target`, catching errors and panics.
pub(crate) async fn run_result(
    target: &str,
    produce: &ResultHandler,
    arguments: Vec<Value>,
) -> HandlerOutcome {
    match AssertUnwindSafe(produce(arguments)).catch_unwind().await {
        Ok(Ok(value)) => HandlerOutcome::Value(value),
        Ok(Err(e)) => {
            tracing::error!(method = %target, error = %e, "invoking client side method failed");
            HandlerOutcome::Failed(e.to_string())
        }
        Err(panic) => {
            let panic = CallbackPanic::new(panic).to_string();
            tracing::error!(method = %target, panic = %panic, "invoking client side method failed");
            HandlerOutcome::Failed(panic)
        }
    }
}
