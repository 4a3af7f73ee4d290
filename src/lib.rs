//! Bounded-concurrency resilience primitives for tokio applications.
//!
//! This crate provides four independent admission-control primitives that wrap
//! a caller-supplied async operation:
//!
//! - [`CircuitBreaker`](resilience::CircuitBreaker): refuses to run an operation after
//!   `threshold` consecutive failures until a cool-down elapses.
//! - [`RateLimiter`](resilience::RateLimiter): a token bucket admitting at most
//!   `batch_size` operations per `interval`.
//! - [`ConcurrencyLimiter`](resilience::ConcurrencyLimiter): caps how many operations
//!   run at the same time.
//! - [`with_backoff`](resilience::with_backoff): retries a failing operation with capped,
//!   jittered exponential backoff.
//!
//! Every wait observes a [`Cancellation`](resilience::Cancellation) handle (a
//! cancellation token plus an optional deadline).
//!
//! # Basic Usage
//! ```no_run
//! use std::time::Duration;
//! use resilience_kit::resilience::{
//!     with_backoff, Cancellation, CircuitBreaker, ConcurrencyLimiter, RetryPolicy,
//! };
//!
//! # async fn fetch() -> Result<String, std::io::Error> { Ok(String::new()) }
//! # async fn run() -> Result<(), resilience_kit::resilience::ResilienceError> {
//! let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
//! let limiter = ConcurrencyLimiter::new(8)?;
//! let cancel = Cancellation::new().with_timeout(Duration::from_secs(10));
//!
//! let body = with_backoff(&cancel, &RetryPolicy::default(), || async {
//!     limiter.execute(&cancel, || breaker.execute(fetch)).await
//! })
//! .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//! See [`resilience::ResilienceConfig`] for process-wide defaults.
//!
//! # Metrics
//! Emits metrics through the `metrics` facade; install any recorder to collect them.
pub mod resilience;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
