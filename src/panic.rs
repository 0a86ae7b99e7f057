//! Readable text for panics raised by user callbacks.
//!
//! Handlers and close callbacks run under `catch_unwind`; the payload is
//! reported through [`CallbackPanic`] so one misbehaving callback is logged
//! and the others still run.

use std::{any::Any, fmt};

/// Display adapter over a caught panic payload.
///
/// ```
/// use hubwire::panic::CallbackPanic;
/// assert_eq!(CallbackPanic::new(Box::new("boom")).to_string(), "boom");
/// assert_eq!(CallbackPanic::new(Box::new(String::from("boom"))).to_string(), "boom");
/// assert_eq!(CallbackPanic::new(Box::new(7_u8)).to_string(), "<non-string panic>");
/// ```
#[must_use]
pub struct CallbackPanic(Box<dyn Any + Send>);

impl CallbackPanic {
    pub fn new(payload: Box<dyn Any + Send>) -> Self { Self(payload) }
}

impl fmt::Display for CallbackPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .0
            .downcast_ref::<&'static str>()
            .copied()
            .or_else(|| self.0.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic>");
        f.write_str(text)
    }
}

impl fmt::Debug for CallbackPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallbackPanic").field(&self.to_string()).finish()
    }
}
