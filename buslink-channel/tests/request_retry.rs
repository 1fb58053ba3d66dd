//! Integration tests for the retry-driven request invoker.
//!
//! These tests run [`retry_request`] against a handle-managed channel with
//! a scripted sender and verify:
//! - Transient failures consume the policy exactly once per retry
//! - A timeout inside a chain is classified retryable and the chain can
//!   still succeed
//! - `NoRetry` means exactly one attempt, error surfaced
//! - Fatal errors short-circuit without consulting the policy
//! - The attempt bound halts a chain even with budget to spare
//! - A retry chain that halts on a pure timeout resolves silently with no
//!   response rather than an error
//! - A caller whose budget is already spent still gets one final attempt
//! - A closing client short-circuits with cancellation

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::LocalSet;

use buslink_channel::{
    retry_request, retry_request_typed, EventSink, FaultTolerantHandle, JsonCodec, LinkConfig,
    LinkProvisioner, ProtocolEngine, ProtocolEvent, RequestResponseChannel,
    RequestResponseFactory, RequestSender,
};
use buslink_core::{
    ChannelError, ChannelResult, FixedRetry, NoRetry, RetryPolicy, RetryState, TimeProvider,
    TimeoutTracker, TokioDispatcher, TokioTimeProvider,
};

type Chan = RequestResponseChannel<TokioDispatcher, TokioTimeProvider>;
type Handle = FaultTolerantHandle<
    RequestResponseFactory<EchoProvisioner, TokioDispatcher, TokioTimeProvider>,
    TokioDispatcher,
>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

/// Engine whose peer always accepts the open handshake.
struct AcceptingEngine {
    sink: RefCell<Option<Rc<dyn EventSink>>>,
}

impl AcceptingEngine {
    fn deliver_later(&self, event: ProtocolEvent) {
        let sink = self.sink.borrow().clone();
        tokio::task::spawn_local(async move {
            tokio::task::yield_now().await;
            if let Some(sink) = sink {
                sink.handle_event(event);
            }
        });
    }
}

impl ProtocolEngine for AcceptingEngine {
    fn attach(&self, sink: Rc<dyn EventSink>) {
        *self.sink.borrow_mut() = Some(sink);
    }

    fn open(&self) -> ChannelResult<()> {
        self.deliver_later(ProtocolEvent::RemoteOpen);
        Ok(())
    }

    fn close(&self) -> ChannelResult<()> {
        self.deliver_later(ProtocolEvent::RemoteClose(None));
        Ok(())
    }

    fn abandon(&self) {}
}

/// What the scripted peer does with one sent request.
#[derive(Clone, Copy)]
enum SendBehavior {
    /// Reject the send with a transient peer error.
    RejectBusy,
    /// Reject the send with a non-retryable peer error.
    RejectFatal,
    /// Accept the send and never answer.
    Silent,
    /// Accept the send and answer with a peer-side timeout rejection.
    AnswerTimeout,
    /// Accept the send and answer with the fixture's response payload.
    Respond,
}

/// Sender driven by a per-attempt behavior script; the last entry repeats
/// once the script runs out.
///
/// Responses are routed through a channel slot the test fills once the
/// handle has opened, mimicking the transport's response path.
struct EchoSender {
    script: RefCell<Vec<SendBehavior>>,
    sends: Rc<Cell<u32>>,
    response: Bytes,
    chan: Rc<RefCell<Option<Chan>>>,
}

impl EchoSender {
    fn next_behavior(&self) -> SendBehavior {
        let mut script = self.script.borrow_mut();
        if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().copied().unwrap_or(SendBehavior::Silent)
        }
    }

    fn answer(&self, correlation_id: u64, result: ChannelResult<Bytes>) {
        let chan = self.chan.clone();
        tokio::task::spawn_local(async move {
            loop {
                let channel = chan.borrow().clone();
                match channel {
                    Some(channel) => {
                        channel.deliver_response(correlation_id, result);
                        return;
                    }
                    None => tokio::task::yield_now().await,
                }
            }
        });
    }
}

impl RequestSender for EchoSender {
    fn send(&self, correlation_id: u64, _message_format: u32, _payload: &Bytes) -> ChannelResult<()> {
        self.sends.set(self.sends.get() + 1);
        match self.next_behavior() {
            SendBehavior::RejectBusy => {
                Err(ChannelError::retryable_protocol("com.microsoft:server-busy"))
            }
            SendBehavior::RejectFatal => {
                Err(ChannelError::fatal_protocol("amqp:unauthorized-access"))
            }
            SendBehavior::Silent => Ok(()),
            SendBehavior::AnswerTimeout => {
                self.answer(correlation_id, Err(ChannelError::Timeout));
                Ok(())
            }
            SendBehavior::Respond => {
                self.answer(correlation_id, Ok(self.response.clone()));
                Ok(())
            }
        }
    }
}

struct EchoProvisioner {
    sender: Rc<EchoSender>,
    provisions: Rc<Cell<u32>>,
}

impl LinkProvisioner for EchoProvisioner {
    fn provision(&self) -> ChannelResult<(Rc<dyn ProtocolEngine>, Rc<dyn RequestSender>)> {
        self.provisions.set(self.provisions.get() + 1);
        let engine = Rc::new(AcceptingEngine {
            sink: RefCell::new(None),
        });
        Ok((engine, self.sender.clone()))
    }
}

/// Counts how many times the inner policy is consulted.
struct CountingPolicy<P> {
    inner: P,
    calls: Rc<Cell<u32>>,
}

impl<P: RetryPolicy> RetryPolicy for CountingPolicy<P> {
    fn next_interval(
        &self,
        state: &RetryState,
        last_error: &ChannelError,
        remaining: Duration,
    ) -> Option<Duration> {
        self.calls.set(self.calls.get() + 1);
        self.inner.next_interval(state, last_error, remaining)
    }
}

struct Fixture {
    handle: Handle,
    time: TokioTimeProvider,
    closing: Rc<Cell<bool>>,
    sends: Rc<Cell<u32>>,
    provisions: Rc<Cell<u32>>,
    chan_slot: Rc<RefCell<Option<Chan>>>,
}

fn fixture(script: Vec<SendBehavior>, response: Bytes) -> Fixture {
    let sends = Rc::new(Cell::new(0));
    let chan_slot: Rc<RefCell<Option<Chan>>> = Rc::new(RefCell::new(None));
    let sender = Rc::new(EchoSender {
        script: RefCell::new(script),
        sends: sends.clone(),
        response,
        chan: chan_slot.clone(),
    });
    let provisions = Rc::new(Cell::new(0));
    let provisioner = EchoProvisioner {
        sender,
        provisions: provisions.clone(),
    };
    let dispatcher = TokioDispatcher::new();
    let time = TokioTimeProvider::new();
    let factory = RequestResponseFactory::new(
        "rpc",
        provisioner,
        dispatcher.clone(),
        time.clone(),
        LinkConfig::default(),
    );
    Fixture {
        handle: FaultTolerantHandle::new("rpc", factory, dispatcher),
        time,
        closing: Rc::new(Cell::new(false)),
        sends,
        provisions,
        chan_slot,
    }
}

impl Fixture {
    /// Route responses by filling the channel slot once the handle opens.
    async fn wire_responses(&self) {
        if let Ok(chan) = self.handle.get_or_open().await {
            *self.chan_slot.borrow_mut() = Some(chan);
        }
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried_to_success() {
    LocalSet::new()
        .run_until(async {
            init_tracing();
            let fx = fixture(
                vec![
                    SendBehavior::RejectBusy,
                    SendBehavior::RejectBusy,
                    SendBehavior::Respond,
                ],
                Bytes::from_static(b"pong"),
            );
            let calls = Rc::new(Cell::new(0));
            let policy = CountingPolicy {
                inner: FixedRetry::new(Duration::from_millis(1), 5),
                calls: calls.clone(),
            };
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::from_secs(5));

            let request = retry_request(
                &fx.handle,
                &policy,
                &tracker,
                Bytes::from_static(b"ping"),
                &fx.closing,
                &fx.time,
            );
            let (result, _) = tokio::join!(request, fx.wire_responses());

            let response = result.expect("request should eventually succeed");
            assert_eq!(response, Some(Bytes::from_static(b"pong")));
            assert_eq!(fx.sends.get(), 3);
            assert_eq!(calls.get(), 2);
            assert_eq!(fx.provisions.get(), 1);
        })
        .await;
}

#[tokio::test]
async fn test_timeout_then_transient_error_then_success() {
    LocalSet::new()
        .run_until(async {
            let fx = fixture(
                vec![
                    SendBehavior::AnswerTimeout,
                    SendBehavior::RejectBusy,
                    SendBehavior::Respond,
                ],
                Bytes::from_static(b"pong"),
            );
            let calls = Rc::new(Cell::new(0));
            let policy = CountingPolicy {
                inner: FixedRetry::new(Duration::from_millis(1), 5),
                calls: calls.clone(),
            };
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::from_secs(5));

            let request = retry_request(
                &fx.handle,
                &policy,
                &tracker,
                Bytes::from_static(b"ping"),
                &fx.closing,
                &fx.time,
            );
            let (result, _) = tokio::join!(request, fx.wire_responses());

            // The timeout was classified retryable and the chain went on
            // to succeed; the policy saw both failures.
            let response = result.expect("request should eventually succeed");
            assert_eq!(response, Some(Bytes::from_static(b"pong")));
            assert_eq!(fx.sends.get(), 3);
            assert_eq!(calls.get(), 2);
        })
        .await;
}

#[tokio::test]
async fn test_no_retry_surfaces_error_after_one_attempt() {
    LocalSet::new()
        .run_until(async {
            let fx = fixture(vec![SendBehavior::RejectBusy], Bytes::new());
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::from_secs(5));

            let result = retry_request(
                &fx.handle,
                &NoRetry,
                &tracker,
                Bytes::from_static(b"ping"),
                &fx.closing,
                &fx.time,
            )
            .await;

            match result {
                Err(ChannelError::Protocol { condition, .. }) => {
                    assert_eq!(condition, "com.microsoft:server-busy");
                }
                other => panic!("expected protocol error, got {:?}", other),
            }
            assert_eq!(fx.sends.get(), 1);
        })
        .await;
}

#[tokio::test]
async fn test_fatal_error_never_reaches_the_policy() {
    LocalSet::new()
        .run_until(async {
            let fx = fixture(vec![SendBehavior::RejectFatal], Bytes::new());
            let calls = Rc::new(Cell::new(0));
            let policy = CountingPolicy {
                inner: FixedRetry::new(Duration::from_millis(1), 5),
                calls: calls.clone(),
            };
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::from_secs(5));

            let result = retry_request(
                &fx.handle,
                &policy,
                &tracker,
                Bytes::from_static(b"ping"),
                &fx.closing,
                &fx.time,
            )
            .await;

            match result {
                Err(ChannelError::Protocol {
                    condition,
                    retryable,
                }) => {
                    assert_eq!(condition, "amqp:unauthorized-access");
                    assert!(!retryable);
                }
                other => panic!("expected fatal protocol error, got {:?}", other),
            }
            assert_eq!(fx.sends.get(), 1);
            assert_eq!(calls.get(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_attempt_bound_halts_with_budget_to_spare() {
    LocalSet::new()
        .run_until(async {
            let fx = fixture(vec![SendBehavior::RejectBusy], Bytes::new());
            let calls = Rc::new(Cell::new(0));
            let policy = CountingPolicy {
                inner: FixedRetry::new(Duration::from_millis(1), 2),
                calls: calls.clone(),
            };
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::from_secs(60));

            let result = retry_request(
                &fx.handle,
                &policy,
                &tracker,
                Bytes::from_static(b"ping"),
                &fx.closing,
                &fx.time,
            )
            .await;

            assert!(matches!(result, Err(ChannelError::Protocol { .. })));
            assert_eq!(fx.sends.get(), 2);
            assert_eq!(calls.get(), 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_on_pure_timeout_give_up_silently() {
    LocalSet::new()
        .run_until(async {
            // Sends succeed but nobody ever answers.
            let fx = fixture(vec![SendBehavior::Silent], Bytes::new());
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::from_millis(50));

            let result = retry_request(
                &fx.handle,
                &NoRetry,
                &tracker,
                Bytes::from_static(b"ping"),
                &fx.closing,
                &fx.time,
            )
            .await;

            assert_eq!(result.expect("pure timeout resolves cleanly"), None);
            assert_eq!(fx.sends.get(), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_on_real_failure_surface_last_error() {
    LocalSet::new()
        .run_until(async {
            let fx = fixture(vec![SendBehavior::RejectBusy], Bytes::new());
            let calls = Rc::new(Cell::new(0));
            let policy = CountingPolicy {
                inner: FixedRetry::new(Duration::from_millis(10), 10),
                calls: calls.clone(),
            };
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::from_millis(25));

            let result = retry_request(
                &fx.handle,
                &policy,
                &tracker,
                Bytes::from_static(b"ping"),
                &fx.closing,
                &fx.time,
            )
            .await;

            // Not a timeout, so the last error must come back.
            assert!(matches!(result, Err(ChannelError::Protocol { .. })));
            assert_eq!(fx.sends.get(), 3);
            assert_eq!(calls.get(), 3);
        })
        .await;
}

#[tokio::test]
async fn test_spent_budget_still_gets_one_final_attempt() {
    LocalSet::new()
        .run_until(async {
            let fx = fixture(vec![SendBehavior::Respond], Bytes::from_static(b"pong"));
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::ZERO);

            let request = retry_request(
                &fx.handle,
                &NoRetry,
                &tracker,
                Bytes::from_static(b"ping"),
                &fx.closing,
                &fx.time,
            );
            let (result, _) = tokio::join!(request, fx.wire_responses());

            assert_eq!(
                result.expect("final attempt should run"),
                Some(Bytes::from_static(b"pong"))
            );
            assert_eq!(fx.sends.get(), 1);
        })
        .await;
}

#[tokio::test]
async fn test_closing_client_cancels_before_any_attempt() {
    LocalSet::new()
        .run_until(async {
            let fx = fixture(vec![SendBehavior::Respond], Bytes::from_static(b"pong"));
            fx.closing.set(true);
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::from_secs(5));

            let result = retry_request(
                &fx.handle,
                &FixedRetry::new(Duration::from_millis(1), 5),
                &tracker,
                Bytes::from_static(b"ping"),
                &fx.closing,
                &fx.time,
            )
            .await;

            assert!(matches!(result, Err(ChannelError::Cancelled)));
            assert_eq!(fx.provisions.get(), 0);
            assert_eq!(fx.sends.get(), 0);
        })
        .await;
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Pong {
    seq: u32,
}

#[tokio::test]
async fn test_typed_request_roundtrips_through_codec() {
    LocalSet::new()
        .run_until(async {
            let fx = fixture(
                vec![SendBehavior::Respond],
                Bytes::from_static(b"{\"seq\":7}"),
            );
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::from_secs(5));

            let request = retry_request_typed::<_, _, _, _, _, _, Pong>(
                &fx.handle,
                &NoRetry,
                &tracker,
                &Pong { seq: 1 },
                &fx.closing,
                &fx.time,
                &JsonCodec,
            );
            let (result, _) = tokio::join!(request, fx.wire_responses());

            let response = result.expect("typed request should succeed");
            assert_eq!(response, Some(Pong { seq: 7 }));
        })
        .await;
}

#[tokio::test]
async fn test_typed_request_decode_failure_is_codec_error() {
    LocalSet::new()
        .run_until(async {
            let fx = fixture(
                vec![SendBehavior::Respond],
                Bytes::from_static(b"not json {"),
            );
            let tracker = TimeoutTracker::new(fx.time.now(), Duration::from_secs(5));

            let request = retry_request_typed::<_, _, _, _, _, _, Pong>(
                &fx.handle,
                &NoRetry,
                &tracker,
                &Pong { seq: 1 },
                &fx.closing,
                &fx.time,
                &JsonCodec,
            );
            let (result, _) = tokio::join!(request, fx.wire_responses());

            assert!(matches!(result, Err(ChannelError::Codec { .. })));
        })
        .await;
}
