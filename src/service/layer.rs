//! Tower middleware placing an [`AdmissionGate`] in front of a service.

use axum::response::Response;
use futures::future::BoxFuture;
use http::Request;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::ratelimit::{AdmissionGate, Decision};

/// Layer that wraps services with admission control.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    gate: Arc<AdmissionGate>,
}

impl AdmissionLayer {
    /// Create a layer backed by `gate`.
    pub fn new(gate: Arc<AdmissionGate>) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            gate: self.gate.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`].
///
/// Bypassed requests reach the inner service untouched. Limited requests get
/// `X-RateLimit-*` headers on whatever response goes back; denied ones never
/// reach the inner service.
#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    gate: Arc<AdmissionGate>,
}

impl<S, B> Service<Request<B>> for AdmissionService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let (parts, body) = request.into_parts();
        let evaluation = self.gate.evaluate(&parts);

        if evaluation.decision == Decision::Deny {
            let mut response = self.gate.respond(&parts);
            if let Some(headers) = evaluation.headers {
                headers.apply(response.headers_mut());
            }
            return Box::pin(async move { Ok(response) });
        }

        // Use the instance that was polled ready and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let request = Request::from_parts(parts, body);

        Box::pin(async move {
            let mut response = inner.call(request).await?;
            if let Some(headers) = evaluation.headers {
                headers.apply(response.headers_mut());
            }
            Ok(response)
        })
    }
}
