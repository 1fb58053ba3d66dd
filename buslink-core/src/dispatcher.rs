//! Single-threaded event-loop scheduling.
//!
//! The dispatcher is the only execution context permitted to mutate
//! protocol-object state: connection, session, and link state machines all
//! run on one cooperative thread, because the wire-protocol engine is not
//! thread-safe. Every public operation that touches that state is expressed
//! as a work item posted through [`Dispatcher::invoke`], never called
//! directly from arbitrary threads.
//!
//! Scheduling can fail synchronously once the loop has shut down. Callers
//! must surface that [`DispatchError`] to whoever requested the work; a
//! silently dropped task would leave waiters hanging forever.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use crate::error::DispatchError;

/// Scheduler for the single event-loop thread.
///
/// `invoke` posts a future to run on the loop thread after `delay`. All
/// implementations are single-threaded (`!Send` futures are accepted);
/// spawned work runs cooperatively with the wire-protocol engine.
pub trait Dispatcher: Clone + 'static {
    /// Schedule `future` to run on the event-loop thread after `delay`.
    ///
    /// # Errors
    ///
    /// Fails synchronously with [`DispatchError::Shutdown`] if the loop has
    /// already shut down. The future is dropped in that case and the caller
    /// must fail its own completion handle.
    fn invoke<F>(&self, delay: Duration, name: &str, future: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + 'static;

    /// Whether the loop has shut down and no longer accepts work.
    fn is_shutdown(&self) -> bool;
}

/// Tokio-backed dispatcher using `spawn_local`.
///
/// Must be used from within a `tokio::task::LocalSet` (or a runtime that
/// supports local tasks); that LocalSet is the event loop.
#[derive(Clone)]
pub struct TokioDispatcher {
    /// Shared shutdown flag; once set, `invoke` rejects all work.
    shutdown: Rc<Cell<bool>>,
}

impl TokioDispatcher {
    /// Create a new dispatcher bound to the current LocalSet.
    pub fn new() -> Self {
        Self {
            shutdown: Rc::new(Cell::new(false)),
        }
    }

    /// Shut the dispatcher down.
    ///
    /// Idempotent. Already-spawned tasks keep running; new `invoke` calls
    /// fail synchronously.
    pub fn shutdown(&self) {
        if !self.shutdown.get() {
            tracing::debug!("dispatcher shutting down");
            self.shutdown.set(true);
        }
    }
}

impl Default for TokioDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for TokioDispatcher {
    fn invoke<F>(&self, delay: Duration, name: &str, future: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + 'static,
    {
        if self.shutdown.get() {
            tracing::debug!(task = name, "invoke rejected: dispatcher shut down");
            return Err(DispatchError::Shutdown);
        }

        tracing::trace!(task = name, delay_ms = delay.as_millis() as u64, "invoke");
        tokio::task::spawn_local(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            future.await;
        });
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.get()
    }
}
