//! Retry policies for request/response operations.
//!
//! A policy is a pure decision function: given the chain's attempt count,
//! the last error, and the remaining time budget, it returns the delay
//! before the next attempt or `None` to stop. Policies hold no mutable
//! state of their own — the invoker owns a [`RetryState`] per chain and
//! hands it in on every consultation — so one policy instance can safely
//! be shared across independent retry chains.

use std::time::Duration;

use crate::error::ChannelError;

/// Per-chain mutable retry state, owned by the invoker.
///
/// Records how many attempts the chain has made; the invoker calls
/// [`record_attempt`](Self::record_attempt) after each failed attempt,
/// before consulting the policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    /// Create state for a fresh retry chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record one completed attempt.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }
}

/// Decision function mapping the chain state, an error, and remaining
/// budget to the next retry delay, or `None` to stop retrying.
pub trait RetryPolicy {
    /// Delay before the next attempt, or `None` to give up.
    ///
    /// Implementations must return `None` for errors where
    /// [`ChannelError::is_retryable`] is false; the invoker additionally
    /// short-circuits fatal errors without consulting the policy.
    fn next_interval(
        &self,
        state: &RetryState,
        last_error: &ChannelError,
        remaining: Duration,
    ) -> Option<Duration>;
}

/// Retry with a constant delay, bounded by a total attempt count and the
/// remaining budget.
#[derive(Debug, Clone, Copy)]
pub struct FixedRetry {
    /// Delay between attempts.
    pub delay: Duration,

    /// Maximum total attempts for the chain.
    pub max_attempts: u32,
}

impl FixedRetry {
    /// Create a fixed-delay policy allowing at most `max_attempts` total
    /// attempts.
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }
}

impl RetryPolicy for FixedRetry {
    fn next_interval(
        &self,
        state: &RetryState,
        last_error: &ChannelError,
        remaining: Duration,
    ) -> Option<Duration> {
        if !last_error.is_retryable() {
            return None;
        }
        if state.attempts() >= self.max_attempts {
            return None;
        }
        if remaining < self.delay {
            return None;
        }
        Some(self.delay)
    }
}

/// Retry with exponentially growing delays bounded by `max_delay`.
///
/// The policy stays pure by deriving the current step from how much of the
/// chain's budget has already been consumed, rather than counting attempts
/// internally: the delay sequence is `initial, 2*initial, 4*initial, ...`
/// capped at `max_delay`, and the step is whichever entry the elapsed budget
/// has reached.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    /// First delay in the sequence.
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Total budget of the retry chain this policy serves.
    pub budget: Duration,
}

impl ExponentialBackoff {
    /// Create an exponential backoff policy for a chain with `budget`.
    pub fn new(initial_delay: Duration, max_delay: Duration, budget: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            budget,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_interval(
        &self,
        _state: &RetryState,
        last_error: &ChannelError,
        remaining: Duration,
    ) -> Option<Duration> {
        if !last_error.is_retryable() {
            return None;
        }

        let elapsed = self.budget.saturating_sub(remaining);
        let mut delay = self.initial_delay;
        let mut consumed = Duration::ZERO;
        while consumed + delay <= elapsed && delay < self.max_delay {
            consumed += delay;
            delay = std::cmp::min(delay * 2, self.max_delay);
        }

        if remaining < delay {
            return None;
        }
        Some(delay)
    }
}

/// Policy that never retries.
///
/// Useful for callers that want exactly one attempt with the invoker's
/// timeout handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_interval(
        &self,
        _state: &RetryState,
        _last_error: &ChannelError,
        _remaining: Duration,
    ) -> Option<Duration> {
        None
    }
}
