//! `tower` middleware that gates a service through a shared [`CircuitBreaker`].
use std::{
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use tower::{Layer, Service};

use super::{CircuitBreaker, ResilienceError};
use crate::Error as CrateError;

/// Wraps services in a [`CircuitBreakerService`] sharing one breaker.
///
/// ```
/// use std::{sync::Arc, time::Duration};
/// use resilience_kit::resilience::{CircuitBreaker, CircuitBreakerLayer};
/// use tower::{ServiceBuilder, service_fn};
///
/// let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(5)));
/// let service = ServiceBuilder::new()
///     .layer(CircuitBreakerLayer::new(breaker))
///     .service(service_fn(|name: String| async move {
///         Ok::<_, std::io::Error>(format!("hello {name}"))
///     }));
/// # let _ = service;
/// ```
#[derive(Clone, Debug)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: Arc::clone(&self.breaker),
        }
    }
}

/// Rejects calls with [`ResilienceError::CircuitOpen`] while the breaker is open and
/// records every failed call. Errors are boxed; downcast to `ResilienceError` to tell
/// a rejection apart from the inner service's own error.
#[derive(Clone, Debug)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S> CircuitBreakerService<S> {
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, Req> Service<Req> for CircuitBreakerService<S>
where
    S: Service<Req>,
    S::Error: Into<CrateError>,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = CrateError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Req) -> Self::Future {
        if let Err(rejected) = self.breaker.admit() {
            return Box::pin(async move { Err(rejected.into()) });
        }

        let response = self.inner.call(request);
        let breaker = Arc::clone(&self.breaker);
        Box::pin(async move {
            match response.await {
                Ok(response) => Ok(response),
                Err(error) => {
                    if breaker.record_failure() {
                        Err(ResilienceError::CircuitOpen.into())
                    } else {
                        Err(error.into())
                    }
                }
            }
        })
    }
}
