//! Time provider abstraction.
//!
//! All timing in the core (reconnect backoff, request timeouts, link open
//! deadlines) goes through [`TimeProvider`] so that code can run against
//! either real Tokio timers or a virtual clock in tests.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for time operations.
///
/// `now()` returns elapsed time since provider creation as a monotonic
/// `Duration`; all deadlines in the core are expressed against this clock.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Get the current monotonic time.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within the timeout,
    /// or `Err(TimeError::Elapsed)` if it times out.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>;
}

/// Real time provider using Tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    /// Start time for calculating elapsed duration
    start_time: std::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>,
    {
        match tokio::time::timeout(duration, future).await {
            Ok(result) => Ok(result),
            Err(_) => Err(TimeError::Elapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_advances_with_sleep() {
        let time = TokioTimeProvider::new();
        let before = time.now();
        time.sleep(Duration::from_millis(50)).await;
        assert!(time.now() >= before + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapses() {
        let time = TokioTimeProvider::new();
        let result = time
            .timeout(Duration::from_millis(10), std::future::pending::<()>())
            .await;
        assert_eq!(result, Err(TimeError::Elapsed));
    }

    #[tokio::test]
    async fn test_timeout_completes() {
        let time = TokioTimeProvider::new();
        let result = time
            .timeout(Duration::from_secs(1), std::future::ready(7u32))
            .await;
        assert_eq!(result, Ok(7));
    }
}
