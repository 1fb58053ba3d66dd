//! Self-rescheduling batch receive loop.
//!
//! A [`ReceivePump`] pulls message batches from a [`BatchReceiver`] and
//! hands them to a user callback, one iteration per executor task: each
//! iteration submits the next one as a fresh task rather than looping,
//! so the pump never monopolizes the executor. Any error — receive
//! failure, callback failure, or executor rejection — is terminal; the
//! owner is told once through the error callback and must build a new
//! pump to resume.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::oneshot;

use buslink_core::{ChannelError, ChannelResult, Executor};

use crate::protocol::BatchReceiver;

/// Tuning for a [`ReceivePump`].
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    /// Credit granted per receive call; the upper bound on batch size.
    pub batch_size: u32,
    /// Whether to invoke the batch callback for empty batches.
    pub invoke_on_empty_batch: bool,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            invoke_on_empty_batch: false,
        }
    }
}

struct PumpState {
    healthy: bool,
    stop_requested: bool,
    running: bool,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

struct PumpCtx<R, E> {
    receiver: Rc<R>,
    executor: E,
    config: PumpConfig,
    on_batch: Box<dyn Fn(Vec<Bytes>) -> ChannelResult<()>>,
    on_error: Box<dyn Fn(ChannelError)>,
    state: RefCell<PumpState>,
    name: Rc<str>,
}

/// Pull-based receive loop over a [`BatchReceiver`].
///
/// Batches are delivered to the batch callback in receive order, one at a
/// time; the next receive is not issued until the callback returns. The
/// pump is terminal on error and stoppable via [`stop`](ReceivePump::stop).
pub struct ReceivePump<R: BatchReceiver, E: Executor> {
    ctx: Rc<PumpCtx<R, E>>,
}

impl<R: BatchReceiver, E: Executor> Clone for ReceivePump<R, E> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<R: BatchReceiver, E: Executor> ReceivePump<R, E> {
    /// Create a pump. It does not receive until [`start`](Self::start).
    pub fn new(
        name: &str,
        receiver: R,
        executor: E,
        config: PumpConfig,
        on_batch: impl Fn(Vec<Bytes>) -> ChannelResult<()> + 'static,
        on_error: impl Fn(ChannelError) + 'static,
    ) -> Self {
        Self {
            ctx: Rc::new(PumpCtx {
                receiver: Rc::new(receiver),
                executor,
                config,
                on_batch: Box::new(on_batch),
                on_error: Box::new(on_error),
                state: RefCell::new(PumpState {
                    healthy: true,
                    stop_requested: false,
                    running: false,
                    stop_waiters: Vec::new(),
                }),
                name: Rc::from(name),
            }),
        }
    }

    /// Start the pump loop. Idempotent while running.
    pub fn start(&self) {
        {
            let mut state = self.ctx.state.borrow_mut();
            if state.running || !state.healthy || state.stop_requested {
                return;
            }
            state.running = true;
        }
        tracing::debug!(pump = %self.ctx.name, "pump starting");
        schedule(self.ctx.clone());
    }

    /// Whether the pump loop is currently scheduled or receiving.
    pub fn is_running(&self) -> bool {
        self.ctx.state.borrow().running
    }

    /// Whether the pump has hit a terminal error.
    pub fn is_healthy(&self) -> bool {
        self.ctx.state.borrow().healthy
    }

    /// Stop the pump and wait until the loop has fully exited.
    ///
    /// A receive already in flight runs to completion; its batch is
    /// dropped without invoking the batch callback. Idempotent: every
    /// caller's future resolves once the loop is gone.
    pub async fn stop(&self) {
        let rx;
        {
            let mut state = self.ctx.state.borrow_mut();
            state.stop_requested = true;
            if !state.running {
                return;
            }
            let (tx, receiver) = oneshot::channel();
            state.stop_waiters.push(tx);
            rx = receiver;
        }
        tracing::debug!(pump = %self.ctx.name, "pump stop requested");
        // A dropped sender still means the loop exited.
        let _ = rx.await;
    }
}

/// Submit the next loop iteration as a fresh executor task.
fn schedule<R: BatchReceiver, E: Executor>(ctx: Rc<PumpCtx<R, E>>) {
    let task_ctx = ctx.clone();
    let submitted = ctx
        .executor
        .execute("receive_pump", async move { run_once(task_ctx).await });
    if let Err(e) = submitted {
        tracing::warn!(pump = %ctx.name, error = %e, "pump iteration rejected");
        ctx.state.borrow_mut().healthy = false;
        finish(&ctx);
        (ctx.on_error)(ChannelError::Dispatch(e));
    }
}

/// One loop iteration: receive a batch, hand it to the callback, schedule
/// the next iteration.
async fn run_once<R: BatchReceiver, E: Executor>(ctx: Rc<PumpCtx<R, E>>) {
    {
        let state = ctx.state.borrow();
        if state.stop_requested || !state.healthy {
            drop(state);
            finish(&ctx);
            return;
        }
    }

    let batch = match ctx.receiver.receive(ctx.config.batch_size).await {
        Ok(batch) => batch,
        Err(e) => {
            tracing::warn!(pump = %ctx.name, error = %e, "receive failed, pump stopping");
            ctx.state.borrow_mut().healthy = false;
            finish(&ctx);
            (ctx.on_error)(e);
            return;
        }
    };

    // A stop that arrived while the receive was in flight wins: the batch
    // is dropped, the callback never sees it.
    if ctx.state.borrow().stop_requested {
        finish(&ctx);
        return;
    }

    if !batch.is_empty() || ctx.config.invoke_on_empty_batch {
        tracing::trace!(pump = %ctx.name, messages = batch.len(), "delivering batch");
        if let Err(e) = (ctx.on_batch)(batch) {
            if matches!(e, ChannelError::Interrupted) {
                tracing::info!(pump = %ctx.name, "batch handler interrupted, pump stopping");
            } else {
                tracing::warn!(pump = %ctx.name, error = %e, "batch handler failed, pump stopping");
            }
            ctx.state.borrow_mut().healthy = false;
            finish(&ctx);
            (ctx.on_error)(e);
            return;
        }
    }

    schedule(ctx);
}

/// Mark the loop as exited and release everyone waiting in `stop`.
fn finish<R, E>(ctx: &Rc<PumpCtx<R, E>>) {
    let waiters;
    {
        let mut state = ctx.state.borrow_mut();
        state.running = false;
        waiters = std::mem::take(&mut state.stop_waiters);
    }
    for waiter in waiters {
        let _ = waiter.send(());
    }
}
