//! Request admission gate.
//!
//! The gate decides, per request, whether the shared token bucket applies and
//! whether a token is available. Exceptions are checked first and exempt a
//! request outright; filters then define which requests are in scope.

use axum::response::{IntoResponse, Response};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::request::Parts;
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::bucket::TokenBucket;
use super::predicate::Predicate;
use crate::error::Result;

/// Header carrying the bucket capacity.
pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Header carrying the tokens left after the current request.
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Callback producing the response for a denied request.
pub type Responder = Arc<dyn Fn(&Parts) -> Response + Send + Sync>;

/// The builtin deny response: `429 Too Many Requests` with a plain-text body.
pub fn default_responder() -> Responder {
    Arc::new(|_request: &Parts| {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Too Many Requests",
        )
            .into_response()
    })
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Pass the request downstream.
    Forward,
    /// Reject the request via the responder.
    Deny,
}

/// Advisory headers reported for every request the bucket was applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Bucket capacity
    pub limit: u64,
    /// Tokens left after this request
    pub remaining: u64,
}

impl RateLimitHeaders {
    /// Write both headers into `headers`, replacing any existing values.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(self.remaining));
    }
}

/// Result of [`AdmissionGate::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Forward or deny
    pub decision: Decision,
    /// Headers to attach; `None` when the request bypassed the limiter
    pub headers: Option<RateLimitHeaders>,
}

impl Evaluation {
    fn bypass() -> Self {
        Self {
            decision: Decision::Forward,
            headers: None,
        }
    }

    /// Whether the request may proceed.
    pub fn is_forward(&self) -> bool {
        self.decision == Decision::Forward
    }

    /// Whether the request skipped the limiter entirely.
    pub fn is_bypass(&self) -> bool {
        self.headers.is_none()
    }
}

/// A token-bucket admission gate shared by all request-handling tasks.
///
/// Registration methods take `&mut self` and are meant to be called while
/// setting the gate up, before it is shared behind an `Arc`.
pub struct AdmissionGate {
    /// The bucket all limited requests draw from
    bucket: TokenBucket,
    /// Deny-path response builder
    responder: Responder,
    /// All must match for the limiter to apply
    filters: Vec<Box<dyn Predicate>>,
    /// Any match exempts the request
    exceptions: Vec<Box<dyn Predicate>>,
}

impl AdmissionGate {
    /// Create a gate around `bucket` with the default responder.
    pub fn new(bucket: TokenBucket) -> Self {
        debug!(
            capacity = bucket.capacity(),
            policy = ?bucket.policy(),
            "Creating admission gate"
        );
        Self {
            bucket,
            responder: default_responder(),
            filters: Vec::new(),
            exceptions: Vec::new(),
        }
    }

    /// Create a gate that admits `per_second` requests per second with
    /// bursts of up to `capacity`.
    pub fn with_rate(per_second: f64, capacity: u64) -> Result<Self> {
        Ok(Self::new(TokenBucket::with_rate(per_second, capacity)?))
    }

    /// Create a gate that admits `capacity` requests per `window`.
    pub fn with_window(window: Duration, capacity: u64) -> Result<Self> {
        Ok(Self::new(TokenBucket::with_window(window, capacity)?))
    }

    /// Replace the deny-path responder.
    pub fn set_responder(&mut self, responder: Responder) {
        self.responder = responder;
    }

    /// Register a filter. The limiter only applies when every filter matches.
    pub fn add_filter<P: Predicate + 'static>(&mut self, filter: P) {
        self.filters.push(Box::new(filter));
    }

    /// Register an exception. Any matching exception exempts the request.
    pub fn add_exception<P: Predicate + 'static>(&mut self, exception: P) {
        self.exceptions.push(Box::new(exception));
    }

    /// The underlying bucket.
    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Decide whether `request` may proceed, consuming at most one token.
    pub fn evaluate(&self, request: &Parts) -> Evaluation {
        if let Some(index) = self.exceptions.iter().position(|e| e.matches(request)) {
            trace!(uri = %request.uri, exception = index, "Request exempted from rate limit");
            return Evaluation::bypass();
        }

        if let Some(index) = self.filters.iter().position(|f| !f.matches(request)) {
            trace!(uri = %request.uri, filter = index, "Request outside rate limit scope");
            return Evaluation::bypass();
        }

        let taken = self.bucket.take_available(1);
        let headers = RateLimitHeaders {
            limit: self.bucket.capacity(),
            remaining: self.bucket.available(),
        };

        let decision = if taken == 0 {
            debug!(uri = %request.uri, limit = headers.limit, "Rate limit exceeded");
            Decision::Deny
        } else {
            trace!(uri = %request.uri, remaining = headers.remaining, "Request admitted");
            Decision::Forward
        };

        Evaluation {
            decision,
            headers: Some(headers),
        }
    }

    /// Build the deny response for `request` using the configured responder.
    pub fn respond(&self, request: &Parts) -> Response {
        (self.responder)(request)
    }
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("bucket", &self.bucket)
            .field("filters", &self.filters.len())
            .field("exceptions", &self.exceptions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::RefillPolicy;
    use crate::ratelimit::clock::ManualClock;
    use http::{Method, Request};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(method: Method, uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn get(uri: &str) -> Parts {
        request(Method::GET, uri, &[])
    }

    fn gate(capacity: u64) -> (AdmissionGate, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(
            RefillPolicy::Rate { per_second: 1.0 },
            capacity,
            clock.clone(),
        )
        .unwrap();
        (AdmissionGate::new(bucket), clock)
    }

    #[test]
    fn test_forward_then_deny() {
        let (gate, _clock) = gate(2);

        let first = gate.evaluate(&get("/"));
        let second = gate.evaluate(&get("/"));
        let third = gate.evaluate(&get("/"));

        assert_eq!(first.decision, Decision::Forward);
        assert_eq!(second.decision, Decision::Forward);
        assert_eq!(third.decision, Decision::Deny);
        assert_eq!(
            first.headers,
            Some(RateLimitHeaders {
                limit: 2,
                remaining: 1
            })
        );
        assert_eq!(
            third.headers,
            Some(RateLimitHeaders {
                limit: 2,
                remaining: 0
            })
        );
    }

    #[test]
    fn test_exception_bypasses_bucket() {
        let (mut gate, _clock) = gate(1);
        gate.add_exception(|req: &Parts| req.uri.path() == "/health");

        gate.evaluate(&get("/"));
        assert_eq!(gate.bucket().available(), 0);

        let evaluation = gate.evaluate(&get("/health"));
        assert!(evaluation.is_forward());
        assert!(evaluation.is_bypass());
        assert_eq!(gate.bucket().available(), 0);
    }

    #[test]
    fn test_failing_filter_bypasses_bucket() {
        let (mut gate, _clock) = gate(3);
        gate.add_filter(|req: &Parts| req.uri.path().starts_with("/api"));
        gate.add_filter(|req: &Parts| req.method == Method::POST);

        let evaluation = gate.evaluate(&request(Method::GET, "/api/items", &[]));
        assert!(evaluation.is_bypass());
        assert_eq!(gate.bucket().available(), 3);

        let evaluation = gate.evaluate(&request(Method::POST, "/static", &[]));
        assert!(evaluation.is_bypass());
        assert_eq!(gate.bucket().available(), 3);

        let evaluation = gate.evaluate(&request(Method::POST, "/api/items", &[]));
        assert!(evaluation.is_forward());
        assert!(!evaluation.is_bypass());
        assert_eq!(gate.bucket().available(), 2);
    }

    #[test]
    fn test_exceptions_win_over_filters() {
        let (mut gate, _clock) = gate(1);
        gate.add_filter(|_: &Parts| true);
        gate.add_exception(|req: &Parts| req.headers.contains_key("x-internal"));

        gate.evaluate(&get("/"));
        let evaluation = gate.evaluate(&request(Method::GET, "/", &[("x-internal", "true")]));
        assert!(evaluation.is_forward());
        assert!(evaluation.is_bypass());
    }

    #[test]
    fn test_exceptions_short_circuit_in_order() {
        let (mut gate, _clock) = gate(1);
        let calls = Arc::new(AtomicUsize::new(0));

        gate.add_exception(|_: &Parts| true);
        let counter = calls.clone();
        gate.add_exception(move |_: &Parts| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });

        gate.evaluate(&get("/"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_refill_readmits() {
        let (gate, clock) = gate(1);

        assert!(gate.evaluate(&get("/")).is_forward());
        assert!(!gate.evaluate(&get("/")).is_forward());

        clock.advance(Duration::from_secs(1));
        assert!(gate.evaluate(&get("/")).is_forward());
    }

    #[test]
    fn test_default_responder() {
        let (gate, _clock) = gate(1);
        let response = gate.respond(&get("/"));

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_custom_responder() {
        let (mut gate, _clock) = gate(1);
        gate.set_responder(Arc::new(|_: &Parts| {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }));

        assert_eq!(
            gate.respond(&get("/")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_headers_apply() {
        let mut headers = HeaderMap::new();
        RateLimitHeaders {
            limit: 100,
            remaining: 42,
        }
        .apply(&mut headers);

        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "100");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "42");
    }

    #[test]
    fn test_invalid_gate_construction() {
        assert!(AdmissionGate::with_rate(1.0, 0).is_err());
        assert!(AdmissionGate::with_window(Duration::ZERO, 5).is_err());
    }
}
