//! Single-flight open/close over a reusable stateful protocol object.
//!
//! A [`FaultTolerantHandle`] hides reconnection behind a stable handle:
//! any number of concurrent callers can ask for the current object, but at
//! most one open attempt and at most one close attempt is ever in flight.
//! Every caller queued during an attempt observes that attempt's outcome.
//!
//! The handle's state is an explicit four-state tagged union rather than a
//! set of boolean flags; an open arriving during a close (or vice versa) is
//! parked on the in-flight attempt and satisfied once it settles. All state
//! transitions run on the dispatcher thread.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use buslink_core::{ChannelError, ChannelResult, DispatchError, Dispatcher};

/// Lifecycle state reported by a protocol object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Open is in progress.
    Opening,
    /// Open completed; the object is usable.
    Opened,
    /// Close is in progress.
    Closing,
    /// Closed. A closed object is never resurrected; a fresh instance is
    /// built on next use.
    Closed,
}

/// A stateful, reusable network resource managed by a
/// [`FaultTolerantHandle`] (a request/response channel, a send or receive
/// link).
///
/// Cloning shares the same underlying object; all clones observe the same
/// lifecycle. State is only mutated on the dispatcher thread.
#[async_trait(?Send)]
pub trait ProtocolObject: Clone + 'static {
    /// Current lifecycle state.
    fn lifecycle(&self) -> ObjectState;

    /// Tear the object down.
    async fn close(&self) -> ChannelResult<()>;
}

/// Builds a fresh protocol object for each open attempt.
#[async_trait(?Send)]
pub trait ObjectFactory: 'static {
    /// The object type this factory builds.
    type Object: ProtocolObject;

    /// Run one open attempt.
    async fn open(&self) -> ChannelResult<Self::Object>;
}

type OpenWaiter<T> = oneshot::Sender<ChannelResult<T>>;
type CloseWaiter = oneshot::Sender<ChannelResult<()>>;

/// The handle's tagged state. At most one open and one close attempt can
/// be in flight, which the tags encode directly: `Opening` carries the
/// open waiters plus any closes that arrived mid-attempt, `Closing` the
/// mirror image.
enum HandleState<T> {
    /// No object exists (never opened, or closed and discarded).
    NoObject,

    /// An open attempt is in flight.
    Opening {
        waiters: Vec<OpenWaiter<T>>,
        pending_close: Vec<CloseWaiter>,
    },

    /// An object is live and shared by all callers.
    Opened(T),

    /// A close attempt is in flight.
    Closing {
        waiters: Vec<CloseWaiter>,
        pending_open: Vec<OpenWaiter<T>>,
    },
}

/// Shares one lazily-created protocol object across concurrent callers,
/// with at-most-one open and at-most-one close in flight at any time.
///
/// Created once per logical channel for the lifetime of the owning client.
pub struct FaultTolerantHandle<F: ObjectFactory, D: Dispatcher> {
    state: Rc<RefCell<HandleState<F::Object>>>,
    factory: Rc<F>,
    dispatcher: D,
    name: Rc<str>,
}

impl<F: ObjectFactory, D: Dispatcher> Clone for FaultTolerantHandle<F, D> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            factory: self.factory.clone(),
            dispatcher: self.dispatcher.clone(),
            name: self.name.clone(),
        }
    }
}

impl<F: ObjectFactory, D: Dispatcher> FaultTolerantHandle<F, D> {
    /// Create a handle around `factory`. No object is built until the
    /// first [`get_or_open`](Self::get_or_open).
    pub fn new(name: &str, factory: F, dispatcher: D) -> Self {
        Self {
            state: Rc::new(RefCell::new(HandleState::NoObject)),
            factory: Rc::new(factory),
            dispatcher,
            name: Rc::from(name),
        }
    }

    /// Get the live object, opening one if necessary.
    ///
    /// If the object is already opened the result is delivered
    /// immediately. If an open attempt is in flight the caller joins its
    /// waiters; otherwise a new attempt starts. If a close is in flight
    /// the caller is parked and served by a fresh attempt once the close
    /// settles. Exactly one underlying open runs no matter how many
    /// callers are queued, and all of them observe the same outcome.
    ///
    /// # Errors
    ///
    /// Fails with the open attempt's error, or synchronously with
    /// [`ChannelError::Dispatch`] if the attempt could not be scheduled.
    pub async fn get_or_open(&self) -> ChannelResult<F::Object> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_open(tx);
        match rx.await {
            Ok(result) => result,
            // Completion dropped without resolving: the handle was torn
            // down while we waited.
            Err(_) => Err(ChannelError::Cancelled),
        }
    }

    /// Close the current object, if any.
    ///
    /// Idempotent: with no object (or one already closed) this resolves
    /// immediately with success and performs no work. If a close is in
    /// flight the caller joins its waiters. A close arriving during an
    /// open attempt is parked and runs once the open settles.
    pub async fn close(&self) -> ChannelResult<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_close(tx);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Cancelled),
        }
    }

    /// Whether an object is currently live.
    pub fn is_opened(&self) -> bool {
        matches!(&*self.state.borrow(), HandleState::Opened(obj) if obj.lifecycle() == ObjectState::Opened)
    }

    fn enqueue_open(&self, tx: OpenWaiter<F::Object>) {
        let start;
        {
            let mut state = self.state.borrow_mut();
            let current = mem::replace(&mut *state, HandleState::NoObject);
            let (next, start_attempt) = match current {
                HandleState::Opened(obj) => match obj.lifecycle() {
                    ObjectState::Closing | ObjectState::Closed => {
                        // The object died underneath us (peer close or
                        // transport loss). Discard it and build fresh.
                        tracing::debug!(handle = %self.name, "cached object is stale, reopening");
                        (
                            HandleState::Opening {
                                waiters: vec![tx],
                                pending_close: Vec::new(),
                            },
                            true,
                        )
                    }
                    _ => {
                        let _ = tx.send(Ok(obj.clone()));
                        (HandleState::Opened(obj), false)
                    }
                },
                HandleState::Opening {
                    mut waiters,
                    pending_close,
                } => {
                    waiters.push(tx);
                    (
                        HandleState::Opening {
                            waiters,
                            pending_close,
                        },
                        false,
                    )
                }
                HandleState::Closing {
                    waiters,
                    mut pending_open,
                } => {
                    pending_open.push(tx);
                    (
                        HandleState::Closing {
                            waiters,
                            pending_open,
                        },
                        false,
                    )
                }
                HandleState::NoObject => (
                    HandleState::Opening {
                        waiters: vec![tx],
                        pending_close: Vec::new(),
                    },
                    true,
                ),
            };
            *state = next;
            start = start_attempt;
        }
        if start {
            self.spawn_open();
        }
    }

    fn enqueue_close(&self, tx: CloseWaiter) {
        let close_target;
        {
            let mut state = self.state.borrow_mut();
            let current = mem::replace(&mut *state, HandleState::NoObject);
            let (next, target) = match current {
                HandleState::NoObject => {
                    let _ = tx.send(Ok(()));
                    (HandleState::NoObject, None)
                }
                HandleState::Opened(obj) => {
                    if obj.lifecycle() == ObjectState::Closed {
                        // Already closed underneath us; nothing to do.
                        let _ = tx.send(Ok(()));
                        (HandleState::NoObject, None)
                    } else {
                        (
                            HandleState::Closing {
                                waiters: vec![tx],
                                pending_open: Vec::new(),
                            },
                            Some(obj),
                        )
                    }
                }
                HandleState::Closing {
                    mut waiters,
                    pending_open,
                } => {
                    waiters.push(tx);
                    (
                        HandleState::Closing {
                            waiters,
                            pending_open,
                        },
                        None,
                    )
                }
                HandleState::Opening {
                    waiters,
                    mut pending_close,
                } => {
                    pending_close.push(tx);
                    (
                        HandleState::Opening {
                            waiters,
                            pending_close,
                        },
                        None,
                    )
                }
            };
            *state = next;
            close_target = target;
        }
        if let Some(obj) = close_target {
            self.spawn_close(obj);
        }
    }

    /// Post the single open attempt onto the dispatcher.
    fn spawn_open(&self) {
        let this = self.clone();
        let factory = self.factory.clone();
        let name = self.name.clone();
        let scheduled = self
            .dispatcher
            .invoke(Duration::ZERO, "handle_open_attempt", async move {
                tracing::debug!(handle = %name, "starting open attempt");
                let result = factory.open().await;
                this.finish_open(result);
            });
        if let Err(e) = scheduled {
            self.fail_open_in_flight(e);
        }
    }

    /// Post the single close attempt onto the dispatcher.
    fn spawn_close(&self, obj: F::Object) {
        let this = self.clone();
        let name = self.name.clone();
        let scheduled = self
            .dispatcher
            .invoke(Duration::ZERO, "handle_close_attempt", async move {
                tracing::debug!(handle = %name, "starting close attempt");
                let result = obj.close().await;
                this.finish_close(result);
            });
        if let Err(e) = scheduled {
            self.fail_close_in_flight(e);
        }
    }

    /// Settle the in-flight open attempt: fan the outcome out to every
    /// queued waiter in enqueue order, then run a close parked during the
    /// attempt, if any.
    fn finish_open(&self, result: ChannelResult<F::Object>) {
        let follow_close;
        {
            let mut state = self.state.borrow_mut();
            let current = mem::replace(&mut *state, HandleState::NoObject);
            let (next, follow) = match current {
                HandleState::Opening {
                    waiters,
                    pending_close,
                } => match result {
                    Ok(obj) => {
                        tracing::debug!(handle = %self.name, waiters = waiters.len(), "open attempt succeeded");
                        for waiter in waiters {
                            let _ = waiter.send(Ok(obj.clone()));
                        }
                        if pending_close.is_empty() {
                            (HandleState::Opened(obj), None)
                        } else {
                            (
                                HandleState::Closing {
                                    waiters: pending_close,
                                    pending_open: Vec::new(),
                                },
                                Some(obj),
                            )
                        }
                    }
                    Err(e) => {
                        tracing::warn!(handle = %self.name, error = %e, "open attempt failed");
                        for waiter in waiters {
                            let _ = waiter.send(Err(e.clone()));
                        }
                        // Nothing was built, so a close queued during the
                        // attempt has nothing to tear down.
                        for close_waiter in pending_close {
                            let _ = close_waiter.send(Ok(()));
                        }
                        (HandleState::NoObject, None)
                    }
                },
                other => (other, None),
            };
            *state = next;
            follow_close = follow;
        }
        if let Some(obj) = follow_close {
            self.spawn_close(obj);
        }
    }

    /// Settle the in-flight close attempt; the object is discarded either
    /// way. Opens parked during the close get a fresh attempt.
    fn finish_close(&self, result: ChannelResult<()>) {
        let reopen;
        {
            let mut state = self.state.borrow_mut();
            let current = mem::replace(&mut *state, HandleState::NoObject);
            let (next, start_open) = match current {
                HandleState::Closing {
                    waiters,
                    pending_open,
                } => {
                    tracing::debug!(handle = %self.name, waiters = waiters.len(), "close attempt settled");
                    for waiter in waiters {
                        let _ = waiter.send(result.clone());
                    }
                    if pending_open.is_empty() {
                        (HandleState::NoObject, false)
                    } else {
                        (
                            HandleState::Opening {
                                waiters: pending_open,
                                pending_close: Vec::new(),
                            },
                            true,
                        )
                    }
                }
                other => (other, false),
            };
            *state = next;
            reopen = start_open;
        }
        if reopen {
            self.spawn_open();
        }
    }

    /// The open attempt could not be scheduled: fail every queued open
    /// waiter synchronously; parked closes have nothing to tear down.
    fn fail_open_in_flight(&self, error: DispatchError) {
        let mut state = self.state.borrow_mut();
        let current = mem::replace(&mut *state, HandleState::NoObject);
        if let HandleState::Opening {
            waiters,
            pending_close,
        } = current
        {
            tracing::warn!(handle = %self.name, error = %error, "open attempt could not be scheduled");
            for waiter in waiters {
                let _ = waiter.send(Err(ChannelError::Dispatch(error.clone())));
            }
            for close_waiter in pending_close {
                let _ = close_waiter.send(Ok(()));
            }
        } else {
            *state = current;
        }
    }

    /// The close attempt could not be scheduled: fail every queued waiter.
    fn fail_close_in_flight(&self, error: DispatchError) {
        let mut state = self.state.borrow_mut();
        let current = mem::replace(&mut *state, HandleState::NoObject);
        if let HandleState::Closing {
            waiters,
            pending_open,
        } = current
        {
            tracing::warn!(handle = %self.name, error = %error, "close attempt could not be scheduled");
            for waiter in waiters {
                let _ = waiter.send(Err(ChannelError::Dispatch(error.clone())));
            }
            for open_waiter in pending_open {
                let _ = open_waiter.send(Err(ChannelError::Dispatch(error.clone())));
            }
        } else {
            *state = current;
        }
    }
}
