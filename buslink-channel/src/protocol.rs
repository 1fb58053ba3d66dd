//! Collaborator contracts for the wire-protocol engine.
//!
//! The core does not encode or decode protocol frames itself. It drives an
//! external protocol engine through these traits and reacts to the
//! lifecycle events the engine delivers back. All calls in both directions
//! happen on the dispatcher thread; the engine is not thread-safe.

use std::rc::Rc;

use async_trait::async_trait;
use bytes::Bytes;
use buslink_core::ChannelResult;

/// Lifecycle events delivered by the protocol engine.
///
/// Events arrive on the dispatcher thread, in wire order, for one
/// connection, session, or link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The local open frame was written to the wire.
    LocalOpen,

    /// The peer acknowledged the open. May be followed by further
    /// flow-like events; only the first one completes the open.
    RemoteOpen,

    /// The local close frame was written to the wire.
    LocalClose,

    /// The peer closed its end, with an optional error condition.
    ///
    /// Without a preceding local close this is an abrupt close: the peer
    /// is tearing the object down underneath us.
    RemoteClose(Option<String>),

    /// The transport failed with the given error condition.
    TransportError(String),

    /// The transport closed without a close handshake.
    TransportClosed,

    /// The engine has released all resources for this object.
    Final,
}

/// Receiver of protocol events, registered with an engine via
/// [`ProtocolEngine::attach`].
pub trait EventSink {
    /// Handle one lifecycle event. Called on the dispatcher thread.
    fn handle_event(&self, event: ProtocolEvent);
}

/// Handle to one protocol object (connection, session, or link) inside the
/// external wire-protocol engine.
///
/// `open` and `close` enqueue outbound frames and return immediately; the
/// outcome arrives later as [`ProtocolEvent`]s on the attached sink.
pub trait ProtocolEngine: 'static {
    /// Register the sink that will receive this object's lifecycle events.
    fn attach(&self, sink: Rc<dyn EventSink>);

    /// Enqueue the open frame.
    fn open(&self) -> ChannelResult<()>;

    /// Enqueue the close frame, starting a clean close handshake.
    fn close(&self) -> ChannelResult<()>;

    /// Release the underlying transport resource without a handshake.
    ///
    /// Used when the peer cannot or will not complete a clean close: after
    /// a transport error, an abrupt remote close, or a local close when the
    /// remote end is already gone.
    fn abandon(&self);
}

/// Outbound side of a request/response link pair.
///
/// `send` enqueues the already-encoded request frame tagged with its
/// correlation id and message format; the matching response is delivered
/// back to the channel by the surrounding transport via
/// [`RequestResponseChannel::deliver_response`](crate::RequestResponseChannel::deliver_response).
pub trait RequestSender: 'static {
    /// Enqueue one correlated request frame.
    fn send(&self, correlation_id: u64, message_format: u32, payload: &Bytes) -> ChannelResult<()>;
}

/// Pull-based message source for the receive pump.
///
/// `max_batch` is the credit grant: the receiver may return at most that
/// many messages, and the peer may not push more until the next call
/// renews the credit. An empty batch is a normal outcome.
#[async_trait(?Send)]
pub trait BatchReceiver: 'static {
    /// Receive up to `max_batch` messages.
    async fn receive(&self, max_batch: u32) -> ChannelResult<Vec<Bytes>>;
}
