//! Tower service that short-circuits rejected requests with `503` responses.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use http::header::{HeaderValue, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use pin_project::pin_project;
use tower::Service;

use super::layer::Engine;
use super::shedder::Verdict;

/// Base client backoff hint, in seconds.
pub(super) const RETRY_AFTER_BASE_SECS: f64 = 10.0;

/// Randomized spread added on top of the base, so rejected clients do not
/// retry in lockstep.
pub(super) const RETRY_AFTER_JITTER_SECS: f64 = 60.0;

/// Middleware enforcing the shedder's verdict on every request.
///
/// Admitted requests are forwarded to the inner service unchanged. Rejected
/// requests are answered directly with `503 Service Unavailable` and a
/// jittered `Retry-After` header; the inner service never sees them.
#[derive(Clone, Debug)]
pub struct LoadShed<S> {
    inner: S,
    engine: Arc<Engine>,
}

impl<S> LoadShed<S> {
    pub(super) fn new(inner: S, engine: Arc<Engine>) -> Self {
        Self { inner, engine }
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for LoadShed<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: Default,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        if let Some(health_check) = self.engine.health_check.as_deref() {
            // Health probes bypass the engine entirely: no verdict, no rate
            // accounting, no telemetry.
            if request.uri().path() == health_check {
                return ResponseFuture::forward(self.inner.call(request));
            }
        }

        match self.engine.shedder.eval_request() {
            Verdict::Admit => {
                self.engine.tallies.accepted.fetch_add(1, Ordering::Relaxed);
                ResponseFuture::forward(self.inner.call(request))
            }
            Verdict::Reject => {
                self.engine.tallies.rejected.fetch_add(1, Ordering::Relaxed);
                ResponseFuture::reject(service_unavailable(retry_after_secs() as u64))
            }
        }
    }
}

fn retry_after_secs() -> f64 {
    RETRY_AFTER_BASE_SECS + rand::random::<f64>() * RETRY_AFTER_JITTER_SECS
}

fn service_unavailable<B: Default>(retry_after_secs: u64) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

/// Response future for [`LoadShed`].
#[pin_project]
pub struct ResponseFuture<F, B> {
    #[pin]
    kind: Kind<F, B>,
}

#[pin_project(project = KindProj)]
enum Kind<F, B> {
    Forward {
        #[pin]
        future: F,
    },
    Reject {
        response: Option<Response<B>>,
    },
}

impl<F, B> ResponseFuture<F, B> {
    fn forward(future: F) -> Self {
        Self {
            kind: Kind::Forward { future },
        }
    }

    fn reject(response: Response<B>) -> Self {
        Self {
            kind: Kind::Reject {
                response: Some(response),
            },
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<B>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().kind.project() {
            KindProj::Forward { future } => future.poll(cx),
            KindProj::Reject { response } => Poll::Ready(Ok(response
                .take()
                .expect("ResponseFuture polled after completion"))),
        }
    }
}
