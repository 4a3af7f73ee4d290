//! Consecutive-failure circuit breaker.
//!
//! The breaker has two states. It is **open** while `failures >= threshold` and the
//! cool-down has not elapsed since the last failure; otherwise it is **closed**.
//! There is no separate half-open state: once the cool-down has elapsed the next
//! call resets the counters and runs as an ordinary closed call (the probe). A zero
//! `open_duration` disables the cool-down, so only [`CircuitBreaker::reset`] closes
//! the circuit again.
//!
//! Every decision (admission, recording a failure, reset, reconfiguration) happens
//! under one mutex around the whole state, so no caller acts on a stale read.
use std::{
    fmt,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use super::{
    ResilienceError,
    internal_event::{CircuitBreakerRejected, CircuitBreakerTripped},
};

/// Externally visible state of a [`CircuitBreaker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug)]
struct BreakerState {
    failures: u64,
    last_failure: Option<Instant>,
    threshold: u64,
    open_duration: Duration,
}

impl BreakerState {
    fn is_open_at(&self, now: Instant) -> bool {
        if self.failures < self.threshold {
            return false;
        }
        if self.open_duration.is_zero() {
            return true;
        }
        match self.last_failure {
            Some(last) => now.saturating_duration_since(last) <= self.open_duration,
            None => true,
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }
}

pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    tripped: CircuitBreakerTripped,
    rejected: CircuitBreakerRejected,
}

impl CircuitBreaker {
    /// Creates a closed breaker. A `threshold` below 1 is raised to 1.
    pub fn new(threshold: u64, open_duration: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                failures: 0,
                last_failure: None,
                threshold: threshold.max(1),
                open_duration,
            }),
            tripped: CircuitBreakerTripped::register(),
            rejected: CircuitBreakerRejected::register(),
        }
    }

    /// Runs `operation` unless the circuit is open.
    ///
    /// The failure that reaches the threshold is reported as
    /// [`ResilienceError::CircuitOpen`] rather than as the operation's own error.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<crate::Error>,
    {
        self.admit()?;

        match operation().await {
            Ok(value) => Ok(value),
            Err(error) => {
                if self.record_failure() {
                    Err(ResilienceError::CircuitOpen)
                } else {
                    Err(ResilienceError::operation(error))
                }
            }
        }
    }

    /// Admission check. Resets the counters when the cool-down has elapsed so the
    /// caller's attempt becomes the probe.
    pub(crate) fn admit(&self) -> Result<(), ResilienceError> {
        let mut state = self.lock();
        if state.failures < state.threshold {
            return Ok(());
        }
        if state.is_open_at(Instant::now()) {
            self.rejected.emit(state.failures);
            return Err(ResilienceError::CircuitOpen);
        }

        debug!(
            message = "Cool-down elapsed; letting a probe through.",
            failures = state.failures,
            open_duration_ms = %state.open_duration.as_millis(),
        );
        state.reset();
        Ok(())
    }

    /// Records a failed call. Returns `true` when this failure leaves the circuit open.
    pub(crate) fn record_failure(&self) -> bool {
        let mut state = self.lock();
        state.failures = state.failures.saturating_add(1);
        state.last_failure = Some(Instant::now());

        let open = state.failures >= state.threshold;
        if state.failures == state.threshold {
            self.tripped.emit(state.failures);
        }
        open
    }

    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn state(&self) -> CircuitState {
        if self.lock().is_open_at(Instant::now()) {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// `true` while the failure count is below the threshold.
    ///
    /// This is not a third state; it reads the same as ordinary closed operation.
    pub fn is_half_open(&self) -> bool {
        let state = self.lock();
        state.failures < state.threshold
    }

    pub fn failures(&self) -> u64 {
        self.lock().failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.lock().last_failure
    }

    pub fn threshold(&self) -> u64 {
        self.lock().threshold
    }

    pub fn open_duration(&self) -> Duration {
        self.lock().open_duration
    }

    /// Changes the threshold. Values below 1 are raised to 1.
    pub fn set_threshold(&self, threshold: u64) {
        self.lock().threshold = threshold.max(1);
    }

    pub fn set_open_duration(&self, open_duration: Duration) {
        self.lock().open_duration = open_duration;
    }

    // The state is consistent after every critical section, so a poisoned lock
    // still holds valid data.
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("threshold", &state.threshold)
            .field("open_duration", &state.open_duration)
            .field("failures", &state.failures)
            .field("last_failure", &state.last_failure)
            .finish()
    }
}

impl fmt::Display for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        write!(
            f,
            "CircuitBreaker{{threshold={}, open_duration={:?}, failures={}}}",
            state.threshold, state.open_duration, state.failures
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fmt,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use futures::future::join_all;
    use tokio::time;

    use super::*;
    use crate::test_utils::trace_init;

    #[derive(Debug, PartialEq)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    async fn fail() -> Result<(), Boom> {
        Err(Boom)
    }

    async fn succeed() -> Result<(), Boom> {
        Ok(())
    }

    #[test]
    fn threshold_below_one_is_raised() {
        assert_eq!(CircuitBreaker::new(0, Duration::from_secs(1)).threshold(), 1);

        let breaker = CircuitBreaker::new(5, Duration::ZERO);
        assert_eq!(breaker.threshold(), 5);
        assert_eq!(breaker.open_duration(), Duration::ZERO);
        breaker.set_threshold(0);
        assert_eq!(breaker.threshold(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn trips_on_threshold_and_recovers_after_cool_down() {
        trace_init();

        let breaker = CircuitBreaker::new(2, Duration::from_millis(100));

        let first = breaker.execute(fail).await.unwrap_err();
        assert!(matches!(first, ResilienceError::Operation { .. }));
        assert!(first.operation_error().unwrap().is::<Boom>());

        let second = breaker.execute(fail).await.unwrap_err();
        assert!(second.is_circuit_open());
        assert!(breaker.is_open());

        let rejected = breaker.execute(succeed).await.unwrap_err();
        assert!(rejected.is_circuit_open());

        time::advance(Duration::from_millis(150)).await;
        assert!(breaker.is_closed());

        breaker.execute(succeed).await.unwrap();
        assert_eq!(breaker.failures(), 0);
        assert_eq!(breaker.last_failure(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_open_before_cool_down() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(200));
        let _ = breaker.execute(fail).await;
        let _ = breaker.execute(fail).await;

        time::advance(Duration::from_millis(50)).await;
        assert!(breaker.execute(succeed).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn operation_is_not_invoked_while_open() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let _ = breaker.execute(fail).await;

        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Boom>(())
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_open_duration_needs_explicit_reset() {
        let breaker = CircuitBreaker::new(1, Duration::ZERO);
        assert!(breaker.is_closed());

        assert!(breaker.execute(fail).await.unwrap_err().is_circuit_open());
        assert!(breaker.is_open());

        time::advance(Duration::from_secs(3600)).await;
        assert!(breaker.execute(succeed).await.unwrap_err().is_circuit_open());

        breaker.reset();
        assert!(breaker.is_closed());
        breaker.execute(succeed).await.unwrap();
    }

    #[tokio::test]
    async fn success_does_not_reset_failures_while_closed() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(1));
        let _ = breaker.execute(fail).await;
        breaker.execute(succeed).await.unwrap();
        let _ = breaker.execute(fail).await;

        assert_eq!(breaker.failures(), 2);
        assert!(breaker.is_half_open());
        assert!(breaker.execute(succeed).await.is_ok());

        assert!(breaker.execute(fail).await.unwrap_err().is_circuit_open());
        assert!(!breaker.is_half_open());
    }

    #[tokio::test]
    async fn value_is_returned_on_success() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(1));
        let value = breaker.execute(|| async { Ok::<_, Boom>(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failures_are_all_counted() {
        let breaker = Arc::new(CircuitBreaker::new(1_000, Duration::from_secs(1)));

        let tasks = (0..10).map(|_| {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                for i in 0..100 {
                    let _ = breaker
                        .execute(|| async move { if i % 2 == 0 { Err(Boom) } else { Ok(()) } })
                        .await;
                }
            })
        });
        for result in join_all(tasks).await {
            result.unwrap();
        }

        assert_eq!(breaker.failures(), 500);
        assert!(breaker.is_closed());
    }

    #[test]
    fn display_reports_configuration() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(2));
        assert_eq!(
            breaker.to_string(),
            "CircuitBreaker{threshold=3, open_duration=2s, failures=0}"
        );
    }
}
