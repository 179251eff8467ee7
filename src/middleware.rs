//! Ordered transform chain applied to every inbound payload.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::Context;
use crate::error::Result;

/// A transform run over every inbound payload before it is resolved.
///
/// A middleware may rewrite the payload, put values into the [`Context`],
/// or return an error to drop the message. Any
/// `Fn(Context, Vec<u8>) -> Result<(Context, Vec<u8>)>` closure is a
/// middleware.
pub trait Middleware: Send + Sync + 'static {
    /// Transform one message.
    ///
    /// # Errors
    ///
    /// An error aborts processing of this message only.
    fn process(&self, ctx: Context, payload: Vec<u8>) -> Result<(Context, Vec<u8>)>;
}

impl<F> Middleware for F
where
    F: Fn(Context, Vec<u8>) -> Result<(Context, Vec<u8>)> + Send + Sync + 'static,
{
    fn process(&self, ctx: Context, payload: Vec<u8>) -> Result<(Context, Vec<u8>)> {
        (self)(ctx, payload)
    }
}

/// Append-only list of middleware, executed in registration order.
#[derive(Default)]
pub struct MiddlewareChain {
    layers: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware. Safe to call while messages are being dispatched;
    /// messages already in the chain finish with the layers they started with.
    pub fn push(&self, middleware: impl Middleware) {
        self.layers.write().push(Arc::new(middleware));
    }

    /// Number of registered middleware.
    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    /// Returns `true` if no middleware is registered.
    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }

    /// Run every layer in order, threading the context and payload through.
    ///
    /// The layer list is snapshotted under the read lock so a middleware may
    /// itself register more middleware without deadlocking.
    ///
    /// # Errors
    ///
    /// Returns the first middleware error; later layers do not run.
    pub fn run(&self, ctx: Context, payload: Vec<u8>) -> Result<(Context, Vec<u8>)> {
        let layers = self.layers.read().clone();
        layers
            .iter()
            .try_fold((ctx, payload), |(ctx, payload), layer| {
                layer.process(ctx, payload)
            })
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("len", &self.len())
            .finish()
    }
}
