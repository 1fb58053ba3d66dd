//! Correlated request/response channel and the retry-driven invoker.
//!
//! A [`RequestResponseChannel`] sends encoded request frames over a link
//! pair, matches responses back to callers by correlation id, and fails
//! everything pending if the link is lost. The free function
//! [`retry_request`] drives a channel through a [`FaultTolerantHandle`],
//! consulting a [`RetryPolicy`] between attempts under one shared timeout
//! budget.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use buslink_core::{
    ChannelError, ChannelResult, Dispatcher, RetryPolicy, RetryState, TimeProvider, TimeoutTracker,
};

use crate::codec::MessageCodec;
use crate::fault_tolerant::{FaultTolerantHandle, ObjectFactory, ObjectState, ProtocolObject};
use crate::link::{LinkConfig, LinkMonitor};
use crate::protocol::{ProtocolEngine, RequestSender};
use crate::work_item::{ReplayableWorkItem, WorkItem, AMQP_MESSAGE_FORMAT};

/// Floor for a single attempt's timeout. A caller whose budget has run dry
/// still gets one final short attempt rather than an instant failure.
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(10);

/// Builds the link pair for one open attempt.
///
/// Each call must produce a fresh engine and sender; a failed or closed
/// link pair is never resurrected.
pub trait LinkProvisioner: 'static {
    /// Create the engine and outbound sender for a new link pair.
    ///
    /// # Errors
    ///
    /// Fails if the underlying session cannot allocate the links.
    fn provision(&self) -> ChannelResult<(Rc<dyn ProtocolEngine>, Rc<dyn RequestSender>)>;
}

struct ChannelCore {
    next_correlation: u64,
    pending: HashMap<u64, ReplayableWorkItem<Bytes>>,
    lifecycle: ObjectState,
}

impl ChannelCore {
    fn fail_all_pending(&mut self, error: ChannelError) {
        for (_, item) in self.pending.drain() {
            item.fail_with_last_error(error.clone());
        }
    }
}

/// One live request/response channel over a link pair.
///
/// Built by [`RequestResponseFactory`] once the link handshake completes.
/// Cloning shares the same channel. Lost links make the channel stale; the
/// owning [`FaultTolerantHandle`] builds a replacement on next use.
pub struct RequestResponseChannel<D: Dispatcher, T: TimeProvider + 'static> {
    core: Rc<RefCell<ChannelCore>>,
    monitor: LinkMonitor<D>,
    sender: Rc<dyn RequestSender>,
    dispatcher: D,
    time: T,
    name: Rc<str>,
}

impl<D: Dispatcher, T: TimeProvider + 'static> Clone for RequestResponseChannel<D, T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            monitor: self.monitor.clone(),
            sender: self.sender.clone(),
            dispatcher: self.dispatcher.clone(),
            time: self.time.clone(),
            name: self.name.clone(),
        }
    }
}

impl<D: Dispatcher, T: TimeProvider + 'static> RequestResponseChannel<D, T> {
    fn new(
        name: Rc<str>,
        monitor: LinkMonitor<D>,
        sender: Rc<dyn RequestSender>,
        dispatcher: D,
        time: T,
    ) -> Self {
        Self {
            core: Rc::new(RefCell::new(ChannelCore {
                next_correlation: 0,
                pending: HashMap::new(),
                lifecycle: ObjectState::Opened,
            })),
            monitor,
            sender,
            dispatcher,
            time,
            name,
        }
    }

    /// Send one encoded request and wait for the matching response.
    ///
    /// The request is tracked under a fresh correlation id until
    /// [`deliver_response`](Self::deliver_response) resolves it, the
    /// timeout fires, or the link is lost.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Detached`] if the channel is no longer open,
    /// [`ChannelError::Timeout`] if no response arrives within `timeout`.
    pub async fn request(&self, payload: Bytes, timeout: Duration) -> ChannelResult<Bytes> {
        let (tx, rx) = oneshot::channel();
        let correlation_id;
        let encoded;
        let message_format;
        {
            let mut core = self.core.borrow_mut();
            if core.lifecycle != ObjectState::Opened {
                return Err(ChannelError::Detached);
            }
            correlation_id = core.next_correlation;
            core.next_correlation += 1;

            let tracker = TimeoutTracker::new(self.time.now(), timeout);
            let work = WorkItem::new(tx, tracker);
            let item = ReplayableWorkItem::new(work, payload, AMQP_MESSAGE_FORMAT);
            // The wire write uses the bytes the item retains, so a resend
            // is always byte-identical to the original frame.
            encoded = item.encoded().clone();
            message_format = item.message_format();
            core.pending.insert(correlation_id, item);
        }

        tracing::debug!(channel = %self.name, correlation_id, "sending request");
        if let Err(e) = self.sender.send(correlation_id, message_format, &encoded) {
            let mut core = self.core.borrow_mut();
            if let Some(mut item) = core.pending.remove(&correlation_id) {
                item.record_error(e.clone());
                drop(core);
                item.fail_with_last_error(e.clone());
            }
            return Err(e);
        }
        {
            let mut core = self.core.borrow_mut();
            if let Some(item) = core.pending.get_mut(&correlation_id) {
                item.mark_sent();
            }
        }
        self.arm_request_timer(correlation_id, timeout);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Cancelled),
        }
    }

    /// Resolve a pending request by correlation id.
    ///
    /// Called by the surrounding transport when a response frame (or a
    /// rejection) arrives. Unknown ids are ignored: the request already
    /// timed out or was failed by link loss.
    pub fn deliver_response(&self, correlation_id: u64, result: ChannelResult<Bytes>) {
        let item = self.core.borrow_mut().pending.remove(&correlation_id);
        match item {
            Some(item) => item.complete(result),
            None => {
                tracing::debug!(channel = %self.name, correlation_id, "response for unknown request");
            }
        }
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.core.borrow().pending.len()
    }

    /// Timer holds only the correlation id; removal from the pending map
    /// is what disarms it.
    fn arm_request_timer(&self, correlation_id: u64, timeout: Duration) {
        let core = self.core.clone();
        let name = self.name.clone();
        let scheduled = self
            .dispatcher
            .invoke(timeout, "request_timeout", async move {
                let item = core.borrow_mut().pending.remove(&correlation_id);
                if let Some(item) = item {
                    tracing::debug!(channel = %name, correlation_id, "request timed out");
                    item.complete(Err(ChannelError::Timeout));
                }
            });
        match scheduled {
            Ok(()) => {
                let mut core = self.core.borrow_mut();
                if let Some(item) = core.pending.get_mut(&correlation_id) {
                    item.arm_timeout();
                }
            }
            Err(e) => {
                // No timer means the request could hang forever; fail it
                // now instead.
                let item = self.core.borrow_mut().pending.remove(&correlation_id);
                if let Some(item) = item {
                    item.complete(Err(ChannelError::Dispatch(e)));
                }
            }
        }
    }

    fn on_link_loss(&self, error: ChannelError) {
        let mut core = self.core.borrow_mut();
        if core.lifecycle == ObjectState::Closed {
            return;
        }
        let unacked = core
            .pending
            .values()
            .filter(|item| item.is_awaiting_ack())
            .count();
        tracing::warn!(
            channel = %self.name,
            error = %error,
            pending = core.pending.len(),
            unacked,
            "link lost"
        );
        core.lifecycle = ObjectState::Closed;
        let mut items: Vec<_> = core.pending.drain().map(|(_, item)| item).collect();
        drop(core);
        for item in items.drain(..) {
            item.fail_with_last_error(error.clone());
        }
    }
}

#[async_trait(?Send)]
impl<D: Dispatcher, T: TimeProvider + 'static> ProtocolObject for RequestResponseChannel<D, T> {
    fn lifecycle(&self) -> ObjectState {
        self.core.borrow().lifecycle
    }

    async fn close(&self) -> ChannelResult<()> {
        {
            let mut core = self.core.borrow_mut();
            if core.lifecycle == ObjectState::Closed {
                return Ok(());
            }
            core.lifecycle = ObjectState::Closing;
            core.fail_all_pending(ChannelError::Cancelled);
        }
        let result = self.monitor.close().await;
        self.core.borrow_mut().lifecycle = ObjectState::Closed;
        result
    }
}

/// Opens one [`RequestResponseChannel`] per attempt: provisions a fresh
/// link pair, runs the open handshake, and wires link loss back into the
/// channel's pending map.
pub struct RequestResponseFactory<P: LinkProvisioner, D: Dispatcher, T: TimeProvider + 'static> {
    provisioner: P,
    dispatcher: D,
    time: T,
    config: LinkConfig,
    name: Rc<str>,
}

impl<P: LinkProvisioner, D: Dispatcher, T: TimeProvider + 'static> RequestResponseFactory<P, D, T> {
    /// Create a factory for the named channel.
    pub fn new(name: &str, provisioner: P, dispatcher: D, time: T, config: LinkConfig) -> Self {
        Self {
            provisioner,
            dispatcher,
            time,
            config,
            name: Rc::from(name),
        }
    }
}

#[async_trait(?Send)]
impl<P: LinkProvisioner, D: Dispatcher, T: TimeProvider + 'static> ObjectFactory
    for RequestResponseFactory<P, D, T>
{
    type Object = RequestResponseChannel<D, T>;

    async fn open(&self) -> ChannelResult<Self::Object> {
        let (engine, sender) = self.provisioner.provision()?;
        let monitor = LinkMonitor::new(&self.name, engine.clone(), self.dispatcher.clone(), self.config);
        engine.attach(Rc::new(monitor.clone()));
        monitor.open().await?;

        let channel = RequestResponseChannel::new(
            self.name.clone(),
            monitor.clone(),
            sender,
            self.dispatcher.clone(),
            self.time.clone(),
        );
        let loss_target = channel.clone();
        monitor.on_detach(move |error| loss_target.on_link_loss(error));
        Ok(channel)
    }
}

/// Send one request through `handle`, retrying per `policy` under the
/// shared budget in `tracker`.
///
/// Each attempt acquires the current channel (opening or reopening it if
/// needed) and sends the same encoded payload. The invoker owns a
/// [`RetryState`] for the chain and records each failed attempt before
/// consulting the policy; fatal errors never reach the policy at all.
/// After a retryable failure the policy decides: a delay means sleep and
/// try again; `None` halts. A halt on a pure timeout resolves with
/// `Ok(None)` — the caller asked, nobody answered, there is nothing to
/// report. A halt on a real failure surfaces the last error.
///
/// An attempt whose remaining budget is zero still runs, with a floor
/// timeout, so a slow open never consumes the caller's entire budget
/// without a single send.
///
/// # Errors
///
/// The last attempt's error when retries halt on a real failure, or
/// [`ChannelError::Cancelled`] as soon as `closing` is observed set.
pub async fn retry_request<F, D, T, R>(
    handle: &FaultTolerantHandle<F, D>,
    policy: &R,
    tracker: &TimeoutTracker,
    payload: Bytes,
    closing: &Rc<Cell<bool>>,
    time: &T,
) -> ChannelResult<Option<Bytes>>
where
    F: ObjectFactory<Object = RequestResponseChannel<D, T>>,
    D: Dispatcher,
    T: TimeProvider + 'static,
    R: RetryPolicy,
{
    let mut state = RetryState::new();
    loop {
        if closing.get() {
            return Err(ChannelError::Cancelled);
        }

        let remaining = tracker.remaining(time.now());
        let attempt_timeout = remaining.max(MIN_REQUEST_TIMEOUT);

        let attempt = async {
            let channel = handle.get_or_open().await?;
            channel.request(payload.clone(), attempt_timeout).await
        };

        let error = match attempt.await {
            Ok(response) => return Ok(Some(response)),
            Err(e) => e,
        };
        state.record_attempt();
        tracing::debug!(
            error = %error,
            attempt = state.attempts(),
            remaining_ms = remaining.as_millis() as u64,
            "request attempt failed"
        );

        if closing.get() {
            return Err(ChannelError::Cancelled);
        }
        if !error.is_retryable() {
            // Fatal errors never reach the policy.
            return Err(error);
        }

        match policy.next_interval(&state, &error, tracker.remaining(time.now())) {
            Some(delay) => {
                if delay > Duration::ZERO {
                    time.sleep(delay).await;
                }
            }
            None => {
                if error.is_pure_timeout() {
                    // Nobody answered and retries are exhausted: give up
                    // silently, there is no failure to report.
                    return Ok(None);
                }
                return Err(error);
            }
        }
    }
}

/// Typed wrapper over [`retry_request`]: encodes the request exactly once
/// with `codec`, replays the same bytes on every retry, and decodes the
/// response.
///
/// # Errors
///
/// [`ChannelError::Codec`] on encode or decode failure, otherwise as
/// [`retry_request`].
pub async fn retry_request_typed<F, D, T, R, C, Req, Resp>(
    handle: &FaultTolerantHandle<F, D>,
    policy: &R,
    tracker: &TimeoutTracker,
    request: &Req,
    closing: &Rc<Cell<bool>>,
    time: &T,
    codec: &C,
) -> ChannelResult<Option<Resp>>
where
    F: ObjectFactory<Object = RequestResponseChannel<D, T>>,
    D: Dispatcher,
    T: TimeProvider + 'static,
    R: RetryPolicy,
    C: MessageCodec,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let encoded = codec.encode(request).map_err(ChannelError::from)?;
    let response =
        retry_request(handle, policy, tracker, Bytes::from(encoded), closing, time).await?;
    match response {
        Some(bytes) => {
            let decoded = codec.decode(&bytes).map_err(ChannelError::from)?;
            Ok(Some(decoded))
        }
        None => Ok(None),
    }
}
