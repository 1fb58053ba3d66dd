//! # buslink-core
//!
//! Core abstractions for the buslink fault-tolerant channel layer.
//!
//! This crate provides the leaf types and provider traits that the channel
//! and link machinery is built on:
//!
//! - [`Dispatcher`]: scheduling onto the single protocol event-loop thread
//! - [`Executor`]: task running for user callbacks, decoupled from the loop
//! - [`TimeProvider`]: sleep, timeout, and monotonic time
//! - [`RetryPolicy`]: pure retry decision functions
//! - [`TimeoutTracker`]: one end-to-end deadline per retry chain
//! - [`ChannelError`]: the shared error taxonomy

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod dispatcher;
mod error;
mod executor;
mod retry;
mod time;
mod timeout;

pub use dispatcher::{Dispatcher, TokioDispatcher};
pub use error::{ChannelError, ChannelResult, DispatchError};
pub use executor::{Executor, TokioExecutor};
pub use retry::{ExponentialBackoff, FixedRetry, NoRetry, RetryPolicy, RetryState};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
pub use timeout::TimeoutTracker;
