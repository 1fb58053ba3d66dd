//! Connection, session, and link lifecycle tracking.
//!
//! A [`LinkMonitor`] drives one protocol object (connection, session, or
//! link) through its open and close handshakes: it enqueues the local
//! frames through the [`ProtocolEngine`], consumes the peer's events as an
//! [`EventSink`], and arms timers on the dispatcher so a silent peer cannot
//! hang a caller forever. All transitions run on the dispatcher thread.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::oneshot;

use buslink_core::{ChannelError, ChannelResult, Dispatcher};

use crate::protocol::{EventSink, ProtocolEngine, ProtocolEvent};

/// Lifecycle states of a tracked protocol object.
///
/// Transitions are strictly forward; `Final` is absorbing. A new object is
/// built for every open, so no state ever runs backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, open not yet requested.
    Uninitialized,
    /// Local open frame sent, awaiting the peer's answer.
    LocalOpen,
    /// Open handshake complete; the object is usable.
    Active,
    /// Local close frame sent, awaiting the peer's answer.
    LocalClose,
    /// Peer closed first; we still owe our own close frame.
    RemoteClose,
    /// Fully terminated. Terminal.
    Final,
}

/// Handshake deadlines for one monitored object.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// How long to wait for the peer to answer our open frame.
    pub open_timeout: Duration,
    /// How long to wait for the peer to answer our close frame before
    /// abandoning the handshake.
    pub close_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(30),
        }
    }
}

/// Peer error conditions that indicate a transient fault worth retrying.
const RETRYABLE_CONDITIONS: &[&str] = &[
    "amqp:connection:forced",
    "amqp:internal-error",
    "amqp:link:detach-forced",
    "amqp:session:window-violation",
    "com.microsoft:server-busy",
    "com.microsoft:timeout",
];

/// Whether a peer error condition is transient.
pub fn is_retryable_condition(condition: &str) -> bool {
    RETRYABLE_CONDITIONS.contains(&condition)
}

struct LinkInner {
    state: LinkState,
    /// Completion for an in-flight `open()` caller.
    opened: Option<oneshot::Sender<ChannelResult<()>>>,
    /// Completion for an in-flight `close()` caller.
    closed: Option<oneshot::Sender<ChannelResult<()>>>,
    /// The peer has already sent its close frame.
    remote_closed: bool,
    /// Bumped on every transition that disarms outstanding timers; a timer
    /// captured with a stale generation no-ops when it fires.
    generation: u64,
    /// Run once if the object terminates without a clean local close.
    detach_hooks: Vec<Box<dyn FnOnce(ChannelError)>>,
}

impl LinkInner {
    fn fail_waiters(&mut self, error: ChannelError) {
        if let Some(tx) = self.opened.take() {
            let _ = tx.send(Err(error.clone()));
        }
        if let Some(tx) = self.closed.take() {
            let _ = tx.send(Err(error));
        }
    }

    fn take_detach_hooks(&mut self) -> Vec<Box<dyn FnOnce(ChannelError)>> {
        std::mem::take(&mut self.detach_hooks)
    }
}

/// Tracks one protocol object's handshake lifecycle.
///
/// Cloning shares the same underlying state; the monitor registers itself
/// (via an `Rc` clone) as the engine's event sink.
pub struct LinkMonitor<D: Dispatcher> {
    inner: Rc<RefCell<LinkInner>>,
    engine: Rc<dyn ProtocolEngine>,
    dispatcher: D,
    config: LinkConfig,
    name: Rc<str>,
}

impl<D: Dispatcher> Clone for LinkMonitor<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
            name: self.name.clone(),
        }
    }
}

impl<D: Dispatcher> LinkMonitor<D> {
    /// Create a monitor around `engine`. The caller must still register the
    /// monitor as the engine's sink via [`ProtocolEngine::attach`].
    pub fn new(name: &str, engine: Rc<dyn ProtocolEngine>, dispatcher: D, config: LinkConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(LinkInner {
                state: LinkState::Uninitialized,
                opened: None,
                closed: None,
                remote_closed: false,
                generation: 0,
                detach_hooks: Vec::new(),
            })),
            engine,
            dispatcher,
            config,
            name: Rc::from(name),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.inner.borrow().state
    }

    /// Register a hook to run if the object terminates abruptly (peer
    /// close, transport loss) rather than through a clean local close.
    pub fn on_detach(&self, hook: impl FnOnce(ChannelError) + 'static) {
        self.inner.borrow_mut().detach_hooks.push(Box::new(hook));
    }

    /// Run the open handshake to completion.
    ///
    /// Sends the local open frame and waits for the peer's answer, bounded
    /// by the configured open timeout. Resolves immediately if the object
    /// is already active.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Timeout`] if the peer never answers,
    /// [`ChannelError::Protocol`] if it answers with an error condition,
    /// [`ChannelError::Detached`] if the object already terminated.
    pub async fn open(&self) -> ChannelResult<()> {
        let rx;
        {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                LinkState::Active => return Ok(()),
                LinkState::Uninitialized => {}
                _ => return Err(ChannelError::Detached),
            }

            inner.state = LinkState::LocalOpen;
            inner.generation += 1;
            let (tx, receiver) = oneshot::channel();
            inner.opened = Some(tx);
            rx = receiver;
        }

        tracing::debug!(link = %self.name, "sending open frame");
        if let Err(e) = self.engine.open() {
            let mut inner = self.inner.borrow_mut();
            inner.state = LinkState::Final;
            inner.opened = None;
            return Err(e);
        }
        self.arm_open_timer();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Cancelled),
        }
    }

    /// Run the close handshake to completion.
    ///
    /// Idempotent: resolves immediately if the object is already final. If
    /// the peer closed first, or does not answer our close frame within the
    /// close timeout, the transport resource is abandoned and the close
    /// still resolves successfully.
    pub async fn close(&self) -> ChannelResult<()> {
        let rx;
        let abandon_now;
        {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                LinkState::Final => return Ok(()),
                LinkState::Uninitialized => {
                    inner.state = LinkState::Final;
                    return Ok(());
                }
                LinkState::LocalClose => {
                    // A close is already in flight; this should not happen
                    // through the handle, which single-flights closes.
                    return Err(ChannelError::Detached);
                }
                _ => {}
            }

            // A close can overtake a pending open handshake; that open will
            // never complete now, so its caller must not be left waiting.
            if let Some(tx) = inner.opened.take() {
                let _ = tx.send(Err(ChannelError::Detached));
            }

            inner.generation += 1;
            abandon_now = inner.remote_closed;
            if abandon_now {
                inner.state = LinkState::Final;
                rx = None;
            } else {
                inner.state = LinkState::LocalClose;
                let (tx, receiver) = oneshot::channel();
                inner.closed = Some(tx);
                rx = Some(receiver);
            }
        }

        if abandon_now {
            // The peer already closed its end; it will not answer our close
            // frame. Release the transport directly.
            tracing::debug!(link = %self.name, "peer already closed, abandoning");
            self.engine.abandon();
            return Ok(());
        }

        tracing::debug!(link = %self.name, "sending close frame");
        if let Err(e) = self.engine.close() {
            let mut inner = self.inner.borrow_mut();
            inner.state = LinkState::Final;
            inner.closed = None;
            drop(inner);
            self.engine.abandon();
            return Err(e);
        }
        self.arm_close_timer();

        match rx {
            Some(receiver) => match receiver.await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Cancelled),
            },
            None => Ok(()),
        }
    }

    fn arm_open_timer(&self) {
        let this = self.clone();
        let generation = self.inner.borrow().generation;
        let scheduled = self.dispatcher.invoke(
            self.config.open_timeout,
            "link_open_timeout",
            async move {
                this.on_open_timeout(generation);
            },
        );
        if let Err(e) = scheduled {
            let mut inner = self.inner.borrow_mut();
            inner.state = LinkState::Final;
            inner.fail_waiters(ChannelError::Dispatch(e));
        }
    }

    fn on_open_timeout(&self, generation: u64) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.generation != generation || inner.state != LinkState::LocalOpen {
                return;
            }
            tracing::warn!(link = %self.name, "open handshake timed out");
            inner.state = LinkState::Final;
            if let Some(tx) = inner.opened.take() {
                let _ = tx.send(Err(ChannelError::Timeout));
            }
        }
        self.engine.abandon();
    }

    fn arm_close_timer(&self) {
        let this = self.clone();
        let generation = self.inner.borrow().generation;
        let scheduled = self.dispatcher.invoke(
            self.config.close_timeout,
            "link_close_timeout",
            async move {
                this.on_close_timeout(generation);
            },
        );
        if let Err(e) = scheduled {
            // The loop is gone; a clean handshake cannot complete. Release
            // the transport and let the close succeed.
            let mut inner = self.inner.borrow_mut();
            tracing::debug!(link = %self.name, error = %e, "close timer rejected, abandoning");
            inner.state = LinkState::Final;
            if let Some(tx) = inner.closed.take() {
                let _ = tx.send(Ok(()));
            }
            drop(inner);
            self.engine.abandon();
        }
    }

    fn on_close_timeout(&self, generation: u64) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.generation != generation || inner.state != LinkState::LocalClose {
                return;
            }
            // The peer never answered the close frame. Abandon the
            // transport; the close itself still succeeds, the object is
            // gone either way.
            tracing::warn!(link = %self.name, "close handshake timed out, abandoning");
            inner.state = LinkState::Final;
            if let Some(tx) = inner.closed.take() {
                let _ = tx.send(Ok(()));
            }
        }
        self.engine.abandon();
    }

    fn error_for_condition(condition: Option<String>) -> ChannelError {
        match condition {
            Some(c) => ChannelError::Protocol {
                retryable: is_retryable_condition(&c),
                condition: c,
            },
            None => ChannelError::Detached,
        }
    }

    fn terminate_abruptly(&self, error: ChannelError) {
        let hooks;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == LinkState::Final {
                return;
            }
            inner.state = LinkState::Final;
            inner.generation += 1;
            inner.fail_waiters(error.clone());
            hooks = inner.take_detach_hooks();
        }
        self.engine.abandon();
        for hook in hooks {
            hook(error.clone());
        }
    }
}

impl<D: Dispatcher> EventSink for LinkMonitor<D> {
    fn handle_event(&self, event: ProtocolEvent) {
        tracing::trace!(link = %self.name, ?event, "protocol event");
        match event {
            // Informational: the local frames were already accounted for
            // when we enqueued them.
            ProtocolEvent::LocalOpen | ProtocolEvent::LocalClose => {}

            ProtocolEvent::RemoteOpen => {
                let mut inner = self.inner.borrow_mut();
                if inner.state != LinkState::LocalOpen {
                    // Duplicate or late remote open; the first one already
                    // completed the handshake.
                    return;
                }
                inner.state = LinkState::Active;
                inner.generation += 1;
                if let Some(tx) = inner.opened.take() {
                    let _ = tx.send(Ok(()));
                }
            }

            ProtocolEvent::RemoteClose(condition) => {
                let clean;
                {
                    let mut inner = self.inner.borrow_mut();
                    if inner.state == LinkState::Final {
                        return;
                    }
                    inner.remote_closed = true;
                    clean = inner.state == LinkState::LocalClose;
                    if clean {
                        // Answer to our own close frame: handshake done.
                        inner.state = LinkState::Final;
                        inner.generation += 1;
                        if let Some(tx) = inner.closed.take() {
                            let _ = tx.send(Ok(()));
                        }
                    } else {
                        inner.state = LinkState::RemoteClose;
                    }
                }
                if !clean {
                    // The peer is tearing the object down underneath us.
                    tracing::warn!(link = %self.name, ?condition, "peer closed abruptly");
                    self.terminate_abruptly(Self::error_for_condition(condition));
                }
            }

            ProtocolEvent::TransportError(condition) => {
                tracing::warn!(link = %self.name, %condition, "transport error");
                self.terminate_abruptly(ChannelError::Protocol {
                    retryable: is_retryable_condition(&condition),
                    condition,
                });
            }

            ProtocolEvent::TransportClosed => {
                tracing::warn!(link = %self.name, "transport closed without handshake");
                self.terminate_abruptly(ChannelError::Detached);
            }

            ProtocolEvent::Final => {
                self.terminate_abruptly(ChannelError::Detached);
            }
        }
    }
}
