//! Interceptors run once per inbound frame before the event is dispatched.
//!
//! A [`MiddlewareChain`] holds an ordered list of [`Middleware`]. For every
//! inbound message the chain is executed against one shared
//! [`MiddlewareContext`]: middleware may rewrite `ctx.args`, inspect the
//! connection, and decide whether the rest of the chain runs by calling
//! [`Next::proceed`]. Not calling it halts the chain.
//!
//! Execution is an explicit work loop over chain indices, so an arbitrarily
//! long chain never grows the stack. Each middleware runs to completion
//! before anything after it; code a middleware places after `proceed()`
//! therefore runs *before* the downstream middleware, not after them.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use parking_lot::RwLock;
use roomcast_core::event_bus::panic_message;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::MiddlewareError;
use crate::handle::ConnectionHandle;
use crate::metrics::{MIDDLEWARE_FAILURES_TOTAL, MIDDLEWARE_HALTS_TOTAL};

/// State shared by every middleware during one chain run.
pub struct MiddlewareContext {
    event: String,
    /// The connection the message arrived on.
    pub connection: ConnectionHandle,
    /// Event arguments. Mutations are visible downstream and to listeners.
    pub args: Vec<Value>,
}

impl MiddlewareContext {
    /// Build a context for one inbound frame.
    pub fn new(event: impl Into<String>, connection: ConnectionHandle, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            connection,
            args,
        }
    }

    /// Decoded event name.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Consume the context, returning the (possibly rewritten) arguments.
    pub fn into_args(self) -> Vec<Value> {
        self.args
    }
}

/// Continuation token handed to each middleware.
#[derive(Debug, Default)]
pub struct Next {
    calls: usize,
}

impl Next {
    /// Run the rest of the chain after this middleware returns.
    ///
    /// Calling it more than once runs the rest of the chain once per call.
    pub fn proceed(&mut self) {
        self.calls += 1;
    }

    /// How many times `proceed` was called.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

/// One link in the chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect or rewrite `ctx`, then call `next.proceed()` to continue.
    async fn handle(&self, ctx: &mut MiddlewareContext, next: &mut Next)
    -> Result<(), MiddlewareError>;
}

/// Middleware built from a synchronous closure. See [`middleware_fn`].
pub struct FnMiddleware<F> {
    f: F,
}

/// Wrap a synchronous closure as [`Middleware`].
pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: Fn(&mut MiddlewareContext, &mut Next) -> Result<(), MiddlewareError> + Send + Sync,
{
    FnMiddleware { f }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut MiddlewareContext, &mut Next) -> Result<(), MiddlewareError> + Send + Sync,
{
    async fn handle(
        &self,
        ctx: &mut MiddlewareContext,
        next: &mut Next,
    ) -> Result<(), MiddlewareError> {
        (self.f)(ctx, next)
    }
}

/// How a chain run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// The end of the chain was reached.
    Completed,
    /// The middleware at index `at` returned without calling `proceed`.
    Halted {
        /// Index of the halting middleware.
        at: usize,
    },
    /// The middleware at index `at` returned an error or panicked.
    Failed {
        /// Index of the failing middleware.
        at: usize,
        /// What went wrong.
        error: MiddlewareError,
    },
}

type Stack = Arc<Vec<Arc<dyn Middleware>>>;

/// Ordered middleware list with copy-on-write registration.
///
/// A run works on a snapshot taken when it starts; middleware added later
/// only affect messages processed afterwards.
#[derive(Default)]
pub struct MiddlewareChain {
    stack: RwLock<Stack>,
}

impl MiddlewareChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one middleware.
    pub fn push(&self, middleware: Arc<dyn Middleware>) {
        Arc::make_mut(&mut *self.stack.write()).push(middleware);
    }

    /// Append several middleware, preserving their order.
    pub fn extend<I>(&self, middleware: I)
    where
        I: IntoIterator<Item = Arc<dyn Middleware>>,
    {
        Arc::make_mut(&mut *self.stack.write()).extend(middleware);
    }

    /// Number of registered middleware.
    pub fn len(&self) -> usize {
        self.stack.read().len()
    }

    /// Whether no middleware is registered.
    pub fn is_empty(&self) -> bool {
        self.stack.read().is_empty()
    }

    /// Run the chain against `ctx`.
    ///
    /// Resolves once every scheduled middleware has finished. The first error
    /// or panic stops the run immediately. The outcome is `Completed` if the
    /// end of the chain was reached at least once.
    pub async fn execute(&self, ctx: &mut MiddlewareContext) -> ChainOutcome {
        let stack = Arc::clone(&self.stack.read());
        let mut pending = vec![0usize];
        let mut completed = false;
        let mut halted_at = None;

        while let Some(index) = pending.pop() {
            let Some(middleware) = stack.get(index) else {
                completed = true;
                continue;
            };

            let mut next = Next::default();
            let result = AssertUnwindSafe(middleware.handle(ctx, &mut next))
                .catch_unwind()
                .await;

            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(panic) => Some(MiddlewareError::Panicked(panic_message(panic.as_ref()))),
            };
            if let Some(error) = error {
                counter!(MIDDLEWARE_FAILURES_TOTAL).increment(1);
                warn!(event = ctx.event(), at = index, %error, "middleware failed");
                return ChainOutcome::Failed { at: index, error };
            }

            if next.calls == 0 {
                let _ = halted_at.get_or_insert(index);
            }
            pending.extend(std::iter::repeat_n(index + 1, next.calls));
        }

        if completed {
            ChainOutcome::Completed
        } else {
            let at = halted_at.unwrap_or_default();
            counter!(MIDDLEWARE_HALTS_TOTAL).increment(1);
            debug!(event = ctx.event(), at, "middleware halted chain");
            ChainOutcome::Halted { at }
        }
    }
}
