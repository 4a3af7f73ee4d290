//! Token-bucket rate limiter.
//!
//! A background task wakes every `interval` and tops the bucket up to `batch_size`
//! tokens. Tokens that do not fit are discarded, so an idle limiter never builds up
//! more than one batch of credit. The bucket starts empty.
use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    runtime::Handle,
    sync::Semaphore,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::{
    CancelReason, Cancellation, ResilienceError,
    internal_event::{RateLimiterRefill, RefillData},
};

const RESOURCE: &str = "rate limiter";

pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    interval: Duration,
    batch_size: usize,
    shutdown: CancellationToken,
}

impl RateLimiter {
    /// Creates a limiter issuing `batch_size` tokens every `interval`.
    ///
    /// Must be called from within a tokio runtime, which runs the refill task.
    pub fn new(interval: Duration, batch_size: usize) -> Result<Self, ResilienceError> {
        Self::spawn(CancellationToken::new(), interval, batch_size)
    }

    /// Like [`RateLimiter::new`], but the refill task also stops when `parent` is
    /// cancelled. The limiter is closed at that point.
    pub fn with_parent(
        parent: &CancellationToken,
        interval: Duration,
        batch_size: usize,
    ) -> Result<Self, ResilienceError> {
        Self::spawn(parent.child_token(), interval, batch_size)
    }

    /// One second interval, ten tokens per batch.
    pub fn default_limits() -> Result<Self, ResilienceError> {
        Self::new(Duration::from_secs(1), 10)
    }

    fn spawn(
        shutdown: CancellationToken,
        interval: Duration,
        batch_size: usize,
    ) -> Result<Self, ResilienceError> {
        if batch_size == 0 {
            return Err(ResilienceError::invalid_config(
                "rate limiter batch_size must be at least 1",
            ));
        }
        if batch_size > Semaphore::MAX_PERMITS {
            return Err(ResilienceError::invalid_config(format!(
                "rate limiter batch_size must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if interval.is_zero() {
            return Err(ResilienceError::invalid_config(
                "rate limiter interval must be non-zero",
            ));
        }
        let handle = Handle::try_current().map_err(|_| {
            ResilienceError::invalid_config("rate limiter must be created inside a tokio runtime")
        })?;

        let start = Instant::now()
            .checked_add(interval)
            .ok_or_else(|| ResilienceError::invalid_config("rate limiter interval is too large"))?;

        let tokens = Arc::new(Semaphore::new(0));
        let mut ticker = time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        handle.spawn(refill(
            Arc::clone(&tokens),
            ticker,
            batch_size,
            shutdown.clone(),
        ));

        debug!(
            message = "Rate limiter started.",
            interval_ms = %interval.as_millis(),
            batch_size,
        );

        Ok(Self {
            tokens,
            interval,
            batch_size,
            shutdown,
        })
    }

    /// Waits for a token, then runs `operation`.
    ///
    /// Returns [`ResilienceError::Cancelled`] if `cancel` fires first,
    /// [`ResilienceError::RateLimitTimeout`] if its deadline passes first, and
    /// [`ResilienceError::Closed`] once the limiter is closed. Waiters are not
    /// admitted in any guaranteed order.
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
        if self.tokens.is_closed() {
            return Err(ResilienceError::Closed { resource: RESOURCE });
        }
        if let Some(reason) = cancel.check() {
            return Err(wait_error(reason));
        }

        let permit = tokio::select! {
            biased;
            reason = cancel.done() => return Err(wait_error(reason)),
            permit = self.tokens.acquire() => {
                permit.map_err(|_| ResilienceError::Closed { resource: RESOURCE })?
            }
        };
        // Tokens are consumed, never returned to the bucket.
        permit.forget();

        operation().await.map_err(ResilienceError::operation)
    }

    /// Stops the refill task. Waiting and future callers get [`ResilienceError::Closed`].
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!(message = "Rate limiter closed.");
        }
        self.shutdown.cancel();
        self.tokens.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tokens.is_closed()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Tokens currently in the bucket.
    pub fn available_tokens(&self) -> usize {
        self.tokens.available_permits()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("interval", &self.interval)
            .field("batch_size", &self.batch_size)
            .field("available_tokens", &self.available_tokens())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn wait_error(reason: CancelReason) -> ResilienceError {
    match reason {
        CancelReason::Cancelled => ResilienceError::Cancelled,
        CancelReason::DeadlineExceeded => ResilienceError::RateLimitTimeout,
    }
}

async fn refill(
    tokens: Arc<Semaphore>,
    mut ticker: Interval,
    batch_size: usize,
    shutdown: CancellationToken,
) {
    let event = RateLimiterRefill::register();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                // Only this task adds permits, so the bucket cannot overflow between
                // the read and the add.
                let issued = batch_size.saturating_sub(tokens.available_permits());
                if issued > 0 {
                    tokens.add_permits(issued);
                }
                event.emit(RefillData {
                    issued: issued as u64,
                    discarded: (batch_size - issued) as u64,
                });
            }
        }
    }
    tokens.close();
    debug!(message = "Rate limiter refill task stopped.");
}
