//! Liveness ticker.
//!
//! Every tick compares the clock with the attempt's two deadlines: silence
//! from the server past `next_server_timeout` stops the connection, and an
//! idle outbound side past `next_ping` queues a ping.

use std::sync::{Arc, Weak};

use tokio::{
    runtime::Handle,
    time::{Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::Inner;

pub(crate) const SERVER_TIMEOUT_ELAPSED: &str =
    "Server timeout elapsed without receiving a message from the server.";

#[derive(Debug, PartialEq, Eq)]
enum Tick {
    Alive,
    TimedOut,
    Gone,
}

pub(super) fn spawn(
    inner: Weak<Inner>,
    attempt: u64,
    runtime: &Handle,
    shutdown: CancellationToken,
    tick_rate: Duration,
) {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(tick_rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = inner.upgrade() else { break };
            match inner.tick(attempt) {
                Tick::Alive => {}
                Tick::Gone => break,
                Tick::TimedOut => {
                    tracing::warn!(attempt, "server timeout elapsed");
                    let _ = inner
                        .stop_with(Some(attempt), Some(SERVER_TIMEOUT_ELAPSED.to_owned()))
                        .await;
                    break;
                }
            }
        }
    });
}

impl Inner {
    fn tick(self: &Arc<Self>, attempt: u64) -> Tick {
        let keep_alive = self.config.keep_alive_interval;
        let mut shared = self.lock();
        let Some(cs) = shared.attempt_mut(attempt) else { return Tick::Gone };
        let now = Instant::now();
        if now > cs.next_server_timeout {
            return Tick::TimedOut;
        }
        if now > cs.next_ping {
            tracing::trace!("sending ping");
            if !cs.enqueue(self.ping.clone(), None, keep_alive) {
                return Tick::Gone;
            }
        }
        Tick::Alive
    }
}
