//! Deadline tracking across retry chains.

use std::time::Duration;

/// Tracks one end-to-end time budget across a chain of retry attempts.
///
/// The tracker captures an absolute deadline at construction and is *not*
/// reset between retries: every attempt in the chain sees the same deadline,
/// so the overall operation respects a single budget. Time is passed in
/// explicitly (the caller's [`TimeProvider::now`](crate::TimeProvider::now)),
/// which keeps the tracker a pure value type.
///
/// A tracker is owned by exactly one logical operation or retry chain and is
/// never shared across independent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutTracker {
    /// Absolute deadline on the owning time provider's clock.
    deadline: Duration,

    /// Original budget, kept for renewal.
    budget: Duration,
}

impl TimeoutTracker {
    /// Create a tracker expiring `budget` after `now`.
    pub fn new(now: Duration, budget: Duration) -> Self {
        Self {
            deadline: now + budget,
            budget,
        }
    }

    /// Remaining budget at `now`, clamped to zero.
    ///
    /// Non-increasing across a retry chain and never negative.
    pub fn remaining(&self, now: Duration) -> Duration {
        self.deadline.saturating_sub(now)
    }

    /// Whether the deadline has passed at `now`.
    ///
    /// An expired tracker does not forbid a final attempt: the invoker still
    /// issues one last request with a minimal timeout rather than failing
    /// locally without contacting the peer.
    pub fn is_expired(&self, now: Duration) -> bool {
        now >= self.deadline
    }

    /// The original budget this tracker was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Restart the budget for a fresh logical operation.
    ///
    /// Never called within a single retry chain.
    pub fn renew(&mut self, now: Duration) {
        self.deadline = now + self.budget;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_counts_down() {
        let tracker = TimeoutTracker::new(Duration::from_secs(10), Duration::from_secs(30));
        assert_eq!(
            tracker.remaining(Duration::from_secs(10)),
            Duration::from_secs(30)
        );
        assert_eq!(
            tracker.remaining(Duration::from_secs(25)),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_remaining_clamps_to_zero() {
        let tracker = TimeoutTracker::new(Duration::from_secs(0), Duration::from_secs(5));
        assert_eq!(tracker.remaining(Duration::from_secs(60)), Duration::ZERO);
        assert!(tracker.is_expired(Duration::from_secs(60)));
    }

    #[test]
    fn test_remaining_is_monotonic() {
        let tracker = TimeoutTracker::new(Duration::ZERO, Duration::from_secs(10));
        let mut last = tracker.remaining(Duration::ZERO);
        for secs in 1..=12 {
            let now = Duration::from_secs(secs);
            let remaining = tracker.remaining(now);
            assert!(remaining <= last);
            last = remaining;
        }
        assert_eq!(last, Duration::ZERO);
    }

    #[test]
    fn test_renew_restarts_budget() {
        let mut tracker = TimeoutTracker::new(Duration::ZERO, Duration::from_secs(5));
        assert!(tracker.is_expired(Duration::from_secs(6)));

        tracker.renew(Duration::from_secs(6));
        assert!(!tracker.is_expired(Duration::from_secs(6)));
        assert_eq!(
            tracker.remaining(Duration::from_secs(6)),
            Duration::from_secs(5)
        );
    }
}
