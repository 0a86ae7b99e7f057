//! Lookup surface the codecs consult to type decoded values.

use crate::value::{BindError, Shape, Value};

/// Supplies the declared shapes needed to bind decoded values.
///
/// Implemented by the connection: handler registrations provide parameter
/// shapes and pending invocations provide result shapes.
pub trait InvocationBinder {
    /// Parameter shapes of the handler registered for `target`, or `None`
    /// when no handler is registered.
    fn parameter_shapes(&self, target: &str) -> Option<Vec<Shape>>;

    /// Expected result or item shape of the pending invocation `invocation_id`.
    fn result_shape(&self, invocation_id: &str) -> Option<Shape>;
}

/// Binder that declares nothing; every value decodes untyped.
#[derive(Debug, Clone, Copy, Default)]
pub struct UntypedBinder;

impl InvocationBinder for UntypedBinder {
    fn parameter_shapes(&self, _target: &str) -> Option<Vec<Shape>> { None }

    fn result_shape(&self, _invocation_id: &str) -> Option<Shape> { None }
}

/// Why an invocation's arguments could not be bound.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ArgumentBindingError {
    #[error("Invocation provides {provided} argument(s) but target expects {expected}.")]
    Arity { provided: usize, expected: usize },
    #[error("Error binding argument {index}. {source}")]
    Argument { index: usize, source: BindError },
    #[error("Malformed arguments: {0}")]
    Malformed(String),
}

/// Bind positional `arguments` against `shapes`.
///
/// With no declared shapes the arguments pass through untouched; a missing
/// handler is the dispatcher's concern, not a binding failure.
///
/// # Errors
///
/// Returns [`ArgumentBindingError`] on arity mismatch or when any argument
/// cannot be bound to its declared shape.
pub fn bind_arguments(
    shapes: Option<&[Shape]>,
    arguments: Vec<Value>,
) -> Result<Vec<Value>, ArgumentBindingError> {
    let Some(shapes) = shapes else {
        return Ok(arguments);
    };
    if shapes.len() != arguments.len() {
        return Err(ArgumentBindingError::Arity {
            provided: arguments.len(),
            expected: shapes.len(),
        });
    }
    shapes
        .iter()
        .zip(arguments)
        .enumerate()
        .map(|(index, (shape, value))| {
            shape
                .bind(value)
                .map_err(|source| ArgumentBindingError::Argument { index, source })
        })
        .collect()
}

/// Bind a result or stream item when its shape is known.
///
/// Values that fail to bind are left untouched; the owning invocation
/// reports the failure when it binds the value itself.
pub(crate) fn bind_result(binder: &dyn InvocationBinder, invocation_id: &str, value: Value) -> Value {
    match binder.result_shape(invocation_id) {
        Some(shape) => shape.bind(value.clone()).unwrap_or(value),
        None => value,
    }
}
