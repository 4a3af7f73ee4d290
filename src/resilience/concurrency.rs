//! Limit the max number of operations running at once.
use std::future::Future;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use super::{
    CancelReason, Cancellation, ResilienceError, internal_event::ConcurrencyLimiterInFlight,
};

const RESOURCE: &str = "concurrency limiter";

/// Fixed-size admission pool. Excess callers wait for a slot, their cancellation,
/// or their deadline, in no guaranteed order.
pub struct ConcurrencyLimiter {
    slots: Semaphore,
    max_concurrent: usize,
    closed: CancellationToken,
    in_flight: ConcurrencyLimiterInFlight,
}

/// Holds an admission slot for the duration of one operation. Dropping it (on
/// success, error, unwinding, or when the caller drops the future) frees the slot.
struct Slot<'a> {
    _permit: SemaphorePermit<'a>,
    limiter: &'a ConcurrencyLimiter,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        // The permit field is released after this runs.
        let active = self.limiter.active().saturating_sub(1);
        self.limiter.in_flight.emit(active as u64);
    }
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Result<Self, ResilienceError> {
        Self::build(CancellationToken::new(), max_concurrent)
    }

    /// Like [`ConcurrencyLimiter::new`], but cancelling `parent` closes the limiter.
    pub fn with_parent(
        parent: &CancellationToken,
        max_concurrent: usize,
    ) -> Result<Self, ResilienceError> {
        Self::build(parent.child_token(), max_concurrent)
    }

    /// Ten concurrent slots.
    pub fn default_limits() -> Result<Self, ResilienceError> {
        Self::new(10)
    }

    fn build(closed: CancellationToken, max_concurrent: usize) -> Result<Self, ResilienceError> {
        if max_concurrent == 0 {
            return Err(ResilienceError::invalid_config(
                "concurrency limiter max_concurrent must be at least 1",
            ));
        }
        if max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ResilienceError::invalid_config(format!(
                "concurrency limiter max_concurrent must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }

        Ok(Self {
            slots: Semaphore::new(max_concurrent),
            max_concurrent,
            closed,
            in_flight: ConcurrencyLimiterInFlight::register(),
        })
    }

    /// Waits for a free slot, then runs `operation` while holding it.
    ///
    /// Fails fast with [`ResilienceError::Closed`] if the limiter is closed before or
    /// while waiting. A deadline on `cancel` ends the wait with
    /// [`ResilienceError::ConcurrencyLimitTimeout`]; explicit cancellation ends it
    /// with [`ResilienceError::Cancelled`].
    pub async fn execute<F, Fut, T, E>(
        &self,
        cancel: &Cancellation,
        operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<crate::Error>,
    {
        let slot = self.acquire(cancel).await?;
        let result = operation().await;
        drop(slot);

        result.map_err(ResilienceError::operation)
    }

    async fn acquire(&self, cancel: &Cancellation) -> Result<Slot<'_>, ResilienceError> {
        self.ensure_open(cancel)?;

        let permit = tokio::select! {
            biased;
            reason = cancel.done() => return Err(wait_error(reason)),
            _ = self.closed.cancelled() => return Err(ResilienceError::Closed { resource: RESOURCE }),
            permit = self.slots.acquire() => {
                permit.map_err(|_| ResilienceError::Closed { resource: RESOURCE })?
            }
        };

        // Closing or cancelling may have raced with the acquire; the permit is
        // released if either happened.
        self.ensure_open(cancel)?;

        let slot = Slot {
            _permit: permit,
            limiter: self,
        };
        self.in_flight.emit(self.active() as u64);
        Ok(slot)
    }

    fn ensure_open(&self, cancel: &Cancellation) -> Result<(), ResilienceError> {
        if self.is_closed() {
            return Err(ResilienceError::Closed { resource: RESOURCE });
        }
        match cancel.check() {
            Some(reason) => Err(wait_error(reason)),
            None => Ok(()),
        }
    }

    /// Fails all current and future waiters with [`ResilienceError::Closed`].
    /// Operations already running are left to finish.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            info!(
                message = "Concurrency limiter closed.",
                active = self.active(),
            );
        }
        self.closed.cancel();
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Operations currently holding a slot.
    pub fn active(&self) -> usize {
        self.max_concurrent - self.available()
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("max_concurrent", &self.max_concurrent)
            .field("active", &self.active())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn wait_error(reason: CancelReason) -> ResilienceError {
    match reason {
        CancelReason::Cancelled => ResilienceError::Cancelled,
        CancelReason::DeadlineExceeded => ResilienceError::ConcurrencyLimitTimeout,
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
        time::Duration,
    };

    use futures::future::join_all;
    use tokio::time::{self, sleep};
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;
    use crate::test_utils::trace_init;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn zero_slots_is_a_configuration_error() {
        assert!(matches!(
            ConcurrencyLimiter::new(0),
            Err(ResilienceError::InvalidConfig { .. })
        ));
        let limiter = ConcurrencyLimiter::default_limits().unwrap();
        assert_eq!(limiter.max_concurrent(), 10);
        assert_eq!(limiter.available(), 10);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_with_short_deadline_times_out() {
        trace_init();

        let limiter = ConcurrencyLimiter::new(1).unwrap();

        let cancel = Cancellation::new();
        let mut slow = task::spawn(limiter.execute(&cancel, || async {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, Boom>("slow")
        }));
        assert_pending!(slow.poll());

        let hurried_cancel = Cancellation::new().with_timeout(Duration::from_millis(50));
        let hurried = limiter
            .execute(&hurried_cancel, || async { Ok::<_, Boom>("hurried") })
            .await;
        assert!(matches!(
            hurried.unwrap_err(),
            ResilienceError::ConcurrencyLimitTimeout
        ));

        time::advance(Duration::from_millis(50)).await;
        assert_eq!(assert_ready!(slow.poll()).unwrap(), "slow");
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_runs_more_than_max_concurrent() {
        let limiter = Arc::new(ConcurrencyLimiter::new(3).unwrap());
        let running = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let tasks = (0..20).map(|_| {
            let limiter = Arc::clone(&limiter);
            let running = Arc::clone(&running);
            let high_water = Arc::clone(&high_water);
            tokio::spawn(async move {
                limiter
                    .execute(&Cancellation::new(), || async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        high_water.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, Boom>(())
                    })
                    .await
            })
        });

        for result in join_all(tasks).await {
            result.unwrap().unwrap();
        }
        assert_eq!(high_water.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test]
    async fn slot_is_released_after_operation_error() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let err = limiter
            .execute(&Cancellation::new(), || async { Err::<(), _>(Boom) })
            .await
            .unwrap_err();

        assert!(err.operation_error().unwrap().is::<Boom>());
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn slot_is_released_when_operation_panics() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1).unwrap());

        let panicking = Arc::clone(&limiter);
        let joined = tokio::spawn(async move {
            panicking
                .execute(&Cancellation::new(), || async { explode() })
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(limiter.available(), 1);
    }

    fn explode() -> Result<(), Boom> {
        panic!("operation blew up")
    }

    #[tokio::test]
    async fn slot_is_released_when_caller_drops_the_future() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let cancel = Cancellation::new();

        let mut running = task::spawn(
            limiter.execute(&cancel, std::future::pending::<Result<(), Boom>>),
        );
        assert_pending!(running.poll());
        assert_eq!(limiter.active(), 1);

        drop(running);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn explicit_cancellation_ends_the_wait() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let holder = Cancellation::new();
        let mut holding = task::spawn(
            limiter.execute(&holder, std::future::pending::<Result<(), Boom>>),
        );
        assert_pending!(holding.poll());

        let cancel = Cancellation::new();
        let mut waiting = task::spawn(limiter.execute(&cancel, || async { Ok::<_, Boom>(()) }));
        assert_pending!(waiting.poll());

        cancel.cancel();
        assert!(waiting.is_woken());
        assert!(matches!(
            assert_ready!(waiting.poll()).unwrap_err(),
            ResilienceError::Cancelled
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_waiters_but_not_running_operations() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let cancel = Cancellation::new();

        let mut running = task::spawn(limiter.execute(&cancel, || async {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, Boom>("finished")
        }));
        assert_pending!(running.poll());

        let mut waiting = task::spawn(limiter.execute(&cancel, || async { Ok::<_, Boom>("never") }));
        assert_pending!(waiting.poll());

        limiter.close();
        assert!(assert_ready!(waiting.poll()).unwrap_err().is_closed());
        assert!(limiter
            .execute(&cancel, || async { Ok::<_, Boom>("late") })
            .await
            .unwrap_err()
            .is_closed());

        time::advance(Duration::from_millis(100)).await;
        assert_eq!(assert_ready!(running.poll()).unwrap(), "finished");
    }

    #[tokio::test]
    async fn parent_cancellation_closes_the_limiter() {
        let parent = CancellationToken::new();
        let limiter = ConcurrencyLimiter::with_parent(&parent, 2).unwrap();
        parent.cancel();

        assert!(limiter.is_closed());
        let err = limiter
            .execute(&Cancellation::new(), || async { Ok::<_, Boom>(()) })
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }
}
