//! Token bucket implementation.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};

/// Tolerance applied before truncating a fractional token count.
const ROUNDING_SLACK: f64 = 1e-9;

/// How a bucket gets its tokens back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefillPolicy {
    /// Continuous refill proportional to elapsed time.
    Rate {
        /// Tokens credited per second
        per_second: f64,
    },
    /// Discrete refill once per elapsed window.
    Window {
        /// Length of one window
        window: Duration,
        /// Tokens credited per elapsed window
        amount: u64,
    },
}

impl RefillPolicy {
    fn validate(&self) -> Result<()> {
        match *self {
            RefillPolicy::Rate { per_second } => {
                if !per_second.is_finite() || per_second <= 0.0 {
                    return Err(TollgateError::InvalidConfig(format!(
                        "refill rate must be a positive number, got {}",
                        per_second
                    )));
                }
            }
            RefillPolicy::Window { window, amount } => {
                if window.is_zero() {
                    return Err(TollgateError::InvalidConfig(
                        "refill window must be longer than zero".to_string(),
                    ));
                }
                if amount == 0 {
                    return Err(TollgateError::InvalidConfig(
                        "refill amount must be greater than zero".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Mutable part of the bucket, always accessed under one lock.
struct BucketState {
    available: u64,
    last_refill: Instant,
}

/// A thread-safe token bucket with lazy refill.
///
/// There is no background timer: every read or take first credits whatever
/// the refill policy owes for the time elapsed since the last refill. The
/// refill and the take run inside a single critical section so concurrent
/// callers can never jointly take more than was available.
pub struct TokenBucket {
    /// Maximum number of tokens the bucket holds
    capacity: u64,
    /// Refill policy
    policy: RefillPolicy,
    /// Token count and refill timestamp
    state: Mutex<BucketState>,
    /// Time source
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket driven by the system clock.
    pub fn new(policy: RefillPolicy, capacity: u64) -> Result<Self> {
        Self::with_clock(policy, capacity, Arc::new(SystemClock))
    }

    /// Create a full bucket driven by the given clock.
    pub fn with_clock(policy: RefillPolicy, capacity: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        if capacity == 0 {
            return Err(TollgateError::InvalidConfig(
                "bucket capacity must be greater than zero".to_string(),
            ));
        }
        policy.validate()?;

        debug!(capacity = capacity, policy = ?policy, "Creating token bucket");

        let now = clock.now();
        Ok(Self {
            capacity,
            policy,
            state: Mutex::new(BucketState {
                available: capacity,
                last_refill: now,
            }),
            clock,
        })
    }

    /// Create a bucket refilled at `per_second` tokens per second.
    pub fn with_rate(per_second: f64, capacity: u64) -> Result<Self> {
        Self::new(RefillPolicy::Rate { per_second }, capacity)
    }

    /// Create a bucket refilled to capacity once per `window`.
    pub fn with_window(window: Duration, capacity: u64) -> Result<Self> {
        Self::new(
            RefillPolicy::Window {
                window,
                amount: capacity,
            },
            capacity,
        )
    }

    /// Take up to `n` tokens, returning how many were actually taken.
    ///
    /// Never blocks and never waits for tokens; an empty bucket yields 0.
    pub fn take_available(&self, n: u64) -> u64 {
        let mut state = self.state.lock();
        let now = self.clock.now();
        self.refill(&mut state, now);

        let taken = n.min(state.available);
        state.available -= taken;
        taken
    }

    /// Configured capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current token count after applying any pending refill.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        let now = self.clock.now();
        self.refill(&mut state, now);
        state.available
    }

    /// The refill policy this bucket was built with.
    pub fn policy(&self) -> RefillPolicy {
        self.policy
    }

    /// Credit tokens owed for the time since the last refill.
    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);

        match self.policy {
            RefillPolicy::Rate { per_second } => {
                // Time spent full is never banked.
                if state.available >= self.capacity {
                    state.last_refill = now;
                    return;
                }

                // Products such as 100s * 0.29/s land a hair under the whole
                // number in binary floating point.
                let raw = elapsed.as_secs_f64() * per_second;
                let owed = (raw + ROUNDING_SLACK.max(raw * 1e-12)).floor();
                if owed < 1.0 {
                    return;
                }

                let missing = self.capacity - state.available;
                if owed >= missing as f64 {
                    state.available = self.capacity;
                    state.last_refill = now;
                    return;
                }

                // Advance only by the time the credited tokens account for,
                // keeping the fractional remainder for the next refill.
                let credited = owed as u64;
                state.available += credited;
                let spent = Duration::try_from_secs_f64(credited as f64 / per_second)
                    .unwrap_or(elapsed)
                    .min(elapsed);
                state.last_refill += spent;
            }
            RefillPolicy::Window { window, amount } => {
                if elapsed < window {
                    return;
                }

                let windows = elapsed.as_nanos() / window.as_nanos();
                let credit = u64::try_from(windows)
                    .unwrap_or(u64::MAX)
                    .saturating_mul(amount);
                state.available = state.available.saturating_add(credit).min(self.capacity);
                state.last_refill = now;
            }
        }
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
