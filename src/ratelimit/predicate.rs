//! Request predicates used as gate filters and exceptions.

use http::request::Parts;

/// A pure boolean test over the head of a request.
///
/// Predicates run on the request-handling task for every evaluated request
/// and must not mutate shared state.
pub trait Predicate: Send + Sync {
    /// Whether the request matches.
    fn matches(&self, request: &Parts) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Parts) -> bool + Send + Sync,
{
    fn matches(&self, request: &Parts) -> bool {
        self(request)
    }
}
