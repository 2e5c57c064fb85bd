//! Token bucket and admission gate.

mod bucket;
mod clock;
mod gate;
mod predicate;

pub use bucket::{RefillPolicy, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use gate::{
    default_responder, AdmissionGate, Decision, Evaluation, RateLimitHeaders, Responder,
    RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING,
};
pub use predicate::Predicate;
