//! Exclusive access to the process-wide `logtest` logger.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use logtest::{Logger, Record};
use rstest::fixture;

/// Handle to the global logger with exclusive access.
///
/// Tests asserting on log output hold this for their whole body so records
/// from concurrently running tests do not interleave.
pub struct LoggerHandle {
    guard: MutexGuard<'static, Logger>,
}

impl LoggerHandle {
    /// Acquire the global [`Logger`] and discard records left by earlier
    /// tests.
    pub fn new() -> Self {
        static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

        let logger = LOGGER.get_or_init(|| Mutex::new(Logger::start()));
        let mut guard = logger.lock().unwrap_or_else(PoisonError::into_inner);
        while guard.pop().is_some() {}

        Self { guard }
    }

    /// Drain captured records, keeping those whose message contains `needle`.
    pub fn find(&mut self, needle: &str) -> Vec<Record> {
        std::iter::from_fn(|| self.guard.pop())
            .filter(|record| record.args().contains(needle))
            .collect()
    }
}

impl Default for LoggerHandle {
    fn default() -> Self { Self::new() }
}

impl std::ops::Deref for LoggerHandle {
    type Target = Logger;

    fn deref(&self) -> &Self::Target { &self.guard }
}

impl std::ops::DerefMut for LoggerHandle {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.guard }
}

#[allow(
    unused_braces,
    reason = "rustc false positive for single line rstest fixtures"
)]
#[fixture]
pub fn logger() -> LoggerHandle { LoggerHandle::new() }
