//! Timing and dispatch settings fixed at build time.

use std::time::Duration;

use crate::{http::HttpHeaders, transport::TransportKind};

pub(crate) const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(100);
pub(crate) const DEFAULT_TICK_RATE: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_HANDLER_WORKERS: usize = 4;

/// Upper bound on waiting for the Close message to reach the transport
/// during a clean stop.
pub(crate) const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) transport: TransportKind,
    pub(crate) skip_negotiation: bool,
    pub(crate) headers: HttpHeaders,
    pub(crate) server_timeout: Duration,
    pub(crate) keep_alive_interval: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) negotiate_timeout: Duration,
    pub(crate) tick_rate: Duration,
    pub(crate) handler_workers: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::All,
            skip_negotiation: false,
            headers: HttpHeaders::new(),
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            negotiate_timeout: DEFAULT_NEGOTIATE_TIMEOUT,
            tick_rate: DEFAULT_TICK_RATE,
            handler_workers: DEFAULT_HANDLER_WORKERS,
        }
    }
}
