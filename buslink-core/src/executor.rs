//! General-purpose task runner for user-facing callbacks.
//!
//! The receive pump invokes consumer callbacks through an [`Executor`]
//! that is deliberately decoupled from the [`Dispatcher`](crate::Dispatcher):
//! slow user code must never stall the protocol event loop.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;

use crate::error::DispatchError;

/// Task runner for work that must stay off the protocol event loop.
pub trait Executor: Clone + 'static {
    /// Submit `future` for execution.
    ///
    /// # Errors
    ///
    /// Fails synchronously with [`DispatchError::Rejected`] if the executor
    /// is exhausted or shutting down.
    fn execute<F>(&self, name: &str, future: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + 'static;
}

/// Tokio-backed executor using `spawn_local`.
#[derive(Clone)]
pub struct TokioExecutor {
    shutdown: Rc<Cell<bool>>,
}

impl TokioExecutor {
    /// Create a new executor bound to the current LocalSet.
    pub fn new() -> Self {
        Self {
            shutdown: Rc::new(Cell::new(false)),
        }
    }

    /// Stop accepting new tasks. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.set(true);
    }
}

impl Default for TokioExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for TokioExecutor {
    fn execute<F>(&self, name: &str, future: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + 'static,
    {
        if self.shutdown.get() {
            tracing::debug!(task = name, "execute rejected: executor shut down");
            return Err(DispatchError::Rejected);
        }

        tracing::trace!(task = name, "execute");
        tokio::task::spawn_local(future);
        Ok(())
    }
}
