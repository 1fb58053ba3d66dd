//! In-flight operation tracking.
//!
//! A [`WorkItem`] pairs one operation's completion handle with its
//! [`TimeoutTracker`]. A [`ReplayableWorkItem`] additionally owns the
//! encoded request payload so the same bytes can be resent after an
//! unexpected link loss without the caller re-serializing.

use bytes::Bytes;
use tokio::sync::oneshot;

use buslink_core::{ChannelError, ChannelResult, TimeoutTracker};

/// Standard AMQP message format tag.
pub const AMQP_MESSAGE_FORMAT: u32 = 0;

/// One in-flight operation: completion handle plus timeout tracker.
///
/// Created when the operation is submitted; a timeout timer scheduled on
/// the dispatcher is attached via [`WorkItem::arm_timeout`]. The item is
/// destroyed when completed (success, failure, or timeout) — removal from
/// the owner's pending map is what disarms a still-scheduled timer, which
/// finds nothing to complete and no-ops.
#[derive(Debug)]
pub struct WorkItem<T> {
    completion: oneshot::Sender<ChannelResult<T>>,
    tracker: TimeoutTracker,
    timeout_armed: bool,
}

impl<T> WorkItem<T> {
    /// Create a work item for a submitted operation.
    pub fn new(completion: oneshot::Sender<ChannelResult<T>>, tracker: TimeoutTracker) -> Self {
        Self {
            completion,
            tracker,
            timeout_armed: false,
        }
    }

    /// Record that a timeout timer has been scheduled for this item.
    pub fn arm_timeout(&mut self) {
        self.timeout_armed = true;
    }

    /// Whether a timeout timer has been scheduled.
    pub fn is_timeout_armed(&self) -> bool {
        self.timeout_armed
    }

    /// The timeout tracker owned by this operation.
    pub fn tracker(&self) -> &TimeoutTracker {
        &self.tracker
    }

    /// Resolve the completion handle. Consumes the item.
    ///
    /// The receiving half may already be gone (caller gave up); that is
    /// not an error here.
    pub fn complete(self, result: ChannelResult<T>) {
        let _ = self.completion.send(result);
    }
}

/// A [`WorkItem`] whose encoded request can be resent after link loss.
///
/// Owns the exact bytes that were (or will be) written to the wire, the
/// message format tag, whether the frame is on the wire awaiting
/// acknowledgment, and the last error observed for this operation.
/// Destroyed once acknowledged or permanently failed.
#[derive(Debug)]
pub struct ReplayableWorkItem<T> {
    work: WorkItem<T>,
    encoded: Bytes,
    message_format: u32,
    awaiting_ack: bool,
    last_error: Option<ChannelError>,
}

impl<T> ReplayableWorkItem<T> {
    /// Wrap a work item with its encoded request payload.
    pub fn new(work: WorkItem<T>, encoded: Bytes, message_format: u32) -> Self {
        Self {
            work,
            encoded,
            message_format,
            awaiting_ack: false,
            last_error: None,
        }
    }

    /// The encoded request bytes, reusable across send attempts.
    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    /// The message format tag the payload was encoded with.
    pub fn message_format(&self) -> u32 {
        self.message_format
    }

    /// Mark the frame as handed to the wire, awaiting acknowledgment.
    pub fn mark_sent(&mut self) {
        self.awaiting_ack = true;
    }

    /// Whether the frame is on the wire awaiting acknowledgment.
    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    /// Record an error observed for this operation.
    pub fn record_error(&mut self, error: ChannelError) {
        self.last_error = Some(error);
    }

    /// The most recent error observed, if any.
    pub fn last_error(&self) -> Option<&ChannelError> {
        self.last_error.as_ref()
    }

    /// Attach a scheduled timeout to the underlying work item.
    pub fn arm_timeout(&mut self) {
        self.work.arm_timeout();
    }

    /// The timeout tracker owned by this operation.
    pub fn tracker(&self) -> &TimeoutTracker {
        self.work.tracker()
    }

    /// Resolve the completion handle. Consumes the item.
    pub fn complete(self, result: ChannelResult<T>) {
        self.work.complete(result);
    }

    /// Fail with the last recorded error, or `fallback` if none was seen.
    pub fn fail_with_last_error(mut self, fallback: ChannelError) {
        let error = self.last_error.take().unwrap_or(fallback);
        self.work.complete(Err(error));
    }
}
