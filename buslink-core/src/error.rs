//! Error taxonomy for channel and link operations.
//!
//! Errors fall into distinct classes that drive different recovery behavior:
//!
//! - [`DispatchError`]: the event loop could not accept a posted task.
//!   Surfaced synchronously to the caller that attempted the operation.
//! - [`ChannelError::Protocol`]: the peer reported an explicit error
//!   condition on open, close, or request.
//! - [`ChannelError::Timeout`]: the deadline elapsed without a peer error.
//!   Retryable by construction, so a retry policy never needs a concrete
//!   peer error object to decide whether to continue.
//! - [`ChannelError::Cancelled`]: the owning client began closing while an
//!   operation was pending. Fatal to that operation, never retried.

use thiserror::Error;

/// Errors raised when posting work onto the event loop or an executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The event loop has shut down and no longer accepts tasks.
    #[error("dispatcher shut down")]
    Shutdown,

    /// The executor rejected the task (exhausted or shutting down).
    #[error("executor rejected task")]
    Rejected,
}

/// Errors that can occur on a channel, link, or request operation.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// A task could not be scheduled onto the dispatcher or executor.
    #[error("scheduling failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// The peer reported an explicit error condition.
    #[error("protocol error: {condition}")]
    Protocol {
        /// Symbolic error condition reported by the peer.
        condition: String,

        /// Whether the condition is transient and worth retrying.
        retryable: bool,
    },

    /// The deadline elapsed before the peer answered.
    ///
    /// Synthetic retryable error: no peer error object exists, the peer
    /// simply did not respond in time.
    #[error("operation timed out")]
    Timeout,

    /// The underlying link or session was lost mid-operation.
    ///
    /// Distinct from [`ChannelError::Timeout`]: the transport told us the
    /// link is gone, so a fresh attempt over a recreated link may succeed.
    #[error("link detached")]
    Detached,

    /// The owning client began closing; the pending operation is abandoned.
    #[error("operation cancelled by client shutdown")]
    Cancelled,

    /// A receive-pump user callback signalled thread-level interruption.
    #[error("interrupted")]
    Interrupted,

    /// Payload serialization or deserialization failed.
    #[error("codec error: {message}")]
    Codec {
        /// Details of the codec failure.
        message: String,
    },
}

impl ChannelError {
    /// Whether a retry policy may be consulted for this error.
    ///
    /// Cancellation and interruption are always fatal. Protocol errors
    /// carry their own retryability as reported by the peer.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Timeout | ChannelError::Detached => true,
            ChannelError::Protocol { retryable, .. } => *retryable,
            ChannelError::Dispatch(_)
            | ChannelError::Cancelled
            | ChannelError::Interrupted
            | ChannelError::Codec { .. } => false,
        }
    }

    /// Whether this error is a pure timeout with no peer error attached.
    ///
    /// The request invoker gives up silently (completing with no response)
    /// when a retry policy halts on a pure timeout, but surfaces the last
    /// error when one halts on a real failure.
    pub fn is_pure_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout)
    }

    /// Build a retryable protocol error from a peer condition.
    pub fn retryable_protocol(condition: impl Into<String>) -> Self {
        ChannelError::Protocol {
            condition: condition.into(),
            retryable: true,
        }
    }

    /// Build a non-retryable protocol error from a peer condition.
    pub fn fatal_protocol(condition: impl Into<String>) -> Self {
        ChannelError::Protocol {
            condition: condition.into(),
            retryable: false,
        }
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
