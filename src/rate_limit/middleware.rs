use crate::clock::{Clock, MonotonicClock};
use crate::error::AdmissionError;
use crate::rate_limit::{AdmissionController, Decision};
use pin_project::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// A layer that admits requests through an [`AdmissionController`].
///
/// `key_fn` maps each request to its client key (typically the peer address).
pub struct AdmissionLayer<F, C = MonotonicClock> {
    controller: Arc<AdmissionController<C>>,
    key_fn: Arc<F>,
}

impl<F, C> AdmissionLayer<F, C> {
    pub fn new(controller: Arc<AdmissionController<C>>, key_fn: F) -> Self {
        Self { controller, key_fn: Arc::new(key_fn) }
    }
}

impl<F, C> Clone for AdmissionLayer<F, C> {
    fn clone(&self) -> Self {
        Self { controller: self.controller.clone(), key_fn: self.key_fn.clone() }
    }
}

impl<F, C> fmt::Debug for AdmissionLayer<F, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer").field("key_fn", &"<fn>").finish()
    }
}

impl<S, F, C> Layer<S> for AdmissionLayer<F, C> {
    type Service = AdmissionService<S, F, C>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            controller: self.controller.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Middleware service that rejects over-limit clients before calling `inner`.
pub struct AdmissionService<S, F, C = MonotonicClock> {
    inner: S,
    controller: Arc<AdmissionController<C>>,
    key_fn: Arc<F>,
}

impl<S: Clone, F, C> Clone for AdmissionService<S, F, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            controller: self.controller.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<S: fmt::Debug, F, C> fmt::Debug for AdmissionService<S, F, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService").field("inner", &self.inner).finish()
    }
}

impl<S, F, C, Req> Service<Req> for AdmissionService<S, F, C>
where
    S: Service<Req>,
    F: Fn(&Req) -> String,
    C: Clock,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = AdmissionFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let client = (self.key_fn)(&req);
        match self.controller.check(&client) {
            Decision::Allowed { .. } => AdmissionFuture::Forward { future: self.inner.call(req) },
            Decision::Denied { retry_after } => AdmissionFuture::Rejected { retry_after },
        }
    }
}

/// Response future for [`AdmissionService`].
#[pin_project(project = AdmissionFutureProj)]
#[derive(Debug)]
pub enum AdmissionFuture<Fut> {
    Forward {
        #[pin]
        future: Fut,
    },
    Rejected {
        retry_after: Duration,
    },
}

impl<Fut, T, E> Future for AdmissionFuture<Fut>
where
    Fut: Future<Output = Result<T, E>>,
{
    type Output = Result<T, AdmissionError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            AdmissionFutureProj::Forward { future } => future.poll(cx).map_err(AdmissionError::Inner),
            AdmissionFutureProj::Rejected { retry_after } => {
                Poll::Ready(Err(AdmissionError::Rejected { retry_after: *retry_after }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AdmissionConfig;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[derive(Debug, Clone)]
    struct Request {
        peer: &'static str,
    }

    fn limiter(capacity: u32) -> (Arc<AdmissionController<ManualClock>>, ManualClock) {
        let clock = ManualClock::new();
        let config = AdmissionConfig::default().capacity(capacity);
        (Arc::new(AdmissionController::with_clock(config, clock.clone()).unwrap()), clock)
    }

    #[tokio::test]
    async fn rejected_requests_never_reach_inner() {
        let (controller, _clock) = limiter(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let svc = ServiceBuilder::new()
            .layer(AdmissionLayer::new(controller, |req: &Request| req.peer.to_string()))
            .service(service_fn(move |_req: Request| {
                let calls = counted.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>("queued")
                }
            }));

        let req = Request { peer: "10.0.0.1" };
        assert_eq!(svc.clone().oneshot(req.clone()).await.unwrap(), "queued");
        assert_eq!(svc.clone().oneshot(req.clone()).await.unwrap(), "queued");
        let err = svc.clone().oneshot(req).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Another peer has its own bucket.
        assert!(svc.oneshot(Request { peer: "10.0.0.2" }).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn inner_errors_are_wrapped() {
        let (controller, _clock) = limiter(5);
        let svc = AdmissionLayer::new(controller, |_: &Request| "peer".to_string()).layer(
            service_fn(|_req: Request| async {
                Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "producer failed"))
            }),
        );
        let err = svc.oneshot(Request { peer: "x" }).await.unwrap_err();
        assert!(!err.is_rejected());
        assert_eq!(err.to_string(), "producer failed");
    }
}
