//! Fault-tolerant channel and link lifecycle management for broker clients.
//!
//! This crate layers broker-client resilience on top of the scheduling
//! primitives in `buslink-core`:
//!
//! - [`FaultTolerantHandle`]: shares one lazily-opened protocol object
//!   across concurrent callers with single-flight open and close.
//! - [`LinkMonitor`]: drives a connection, session, or link through its
//!   open and close handshakes against an external protocol engine.
//! - [`RequestResponseChannel`] and [`retry_request`]: correlated
//!   request/response with budgeted retries over reconnecting links.
//! - [`ReceivePump`]: a self-rescheduling batch receive loop that is
//!   terminal on error and stoppable on demand.
//!
//! Everything runs on a single cooperative event-loop thread; shared state
//! uses `Rc<RefCell<_>>`, never locks.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod codec;
pub mod fault_tolerant;
pub mod link;
pub mod protocol;
pub mod pump;
pub mod request_response;
pub mod work_item;

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use fault_tolerant::{FaultTolerantHandle, ObjectFactory, ObjectState, ProtocolObject};
pub use link::{is_retryable_condition, LinkConfig, LinkMonitor, LinkState};
pub use protocol::{BatchReceiver, EventSink, ProtocolEngine, ProtocolEvent, RequestSender};
pub use pump::{PumpConfig, ReceivePump};
pub use request_response::{
    retry_request, retry_request_typed, LinkProvisioner, RequestResponseChannel,
    RequestResponseFactory,
};
pub use work_item::{ReplayableWorkItem, WorkItem, AMQP_MESSAGE_FORMAT};
